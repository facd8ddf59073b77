//! `SoftCq` / `SoftChannel` — software completion queue and its
//! notification channel.
//!
//! The queue is a bounded lock-free FIFO. The channel is an eventfd: one
//! write per fired queue, the waiter blocks in `read()`. Notification is
//! one-shot, like hardware: `arm()` allows exactly one firing, and a
//! completion added while disarmed fires nothing.

use rcm_core::completion::WorkCompletion;
use rcm_core::error::{FabricError, Result};
use rcm_core::handle::{ChannelHandle, CqHandle};

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct SoftChannel {
    handle: ChannelHandle,
    efd: EventFd,
    /// Queues that fired and have not been handed to a waiter yet.
    fired: Mutex<VecDeque<CqHandle>>,
    interrupted: AtomicBool,
}

impl SoftChannel {
    pub fn create(handle: ChannelHandle) -> Result<Self> {
        let efd = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|e| FabricError::os("ibv_create_comp_channel", e.into()))?;
        Ok(Self {
            handle,
            efd,
            fired: Mutex::new(VecDeque::new()),
            interrupted: AtomicBool::new(false),
        })
    }

    fn fire(&self, cq: CqHandle) {
        lock(&self.fired).push_back(cq);
        self.kick();
    }

    fn kick(&self) {
        if let Err(e) = self.efd.write(1) {
            // EAGAIN: counter saturated, a wakeup is already pending.
            if e != Errno::EAGAIN {
                log::error!("{}: eventfd write failed: {}", self.handle, e);
            }
        }
    }

    /// Block until a queue fires. `None` once interrupted.
    pub fn wait(&self) -> Result<Option<CqHandle>> {
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(cq) = lock(&self.fired).pop_front() {
                return Ok(Some(cq));
            }
            match self.efd.read() {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(FabricError::os("ibv_get_cq_event", e.into())),
            }
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.kick();
    }
}

pub struct SoftCq {
    handle: CqHandle,
    entries: ArrayQueue<WorkCompletion>,
    armed: AtomicBool,
    overrun: AtomicBool,
    channel: Arc<SoftChannel>,
    events_delivered: AtomicU64,
    events_acked: AtomicU64,
}

impl SoftCq {
    pub fn new(handle: CqHandle, depth: u32, channel: Arc<SoftChannel>) -> Self {
        Self {
            handle,
            entries: ArrayQueue::new(depth.max(1) as usize),
            armed: AtomicBool::new(false),
            overrun: AtomicBool::new(false),
            channel,
            events_delivered: AtomicU64::new(0),
            events_acked: AtomicU64::new(0),
        }
    }

    /// Add a completion, firing the channel if armed.
    pub fn push(&self, wc: WorkCompletion) {
        if self.entries.push(wc).is_err() {
            log::error!("{} overrun, dropping completion for {}", self.handle, wc.wr_id);
            self.overrun.store(true, Ordering::Release);
        }
        if self.armed.swap(false, Ordering::AcqRel) {
            self.events_delivered.fetch_add(1, Ordering::Relaxed);
            self.channel.fire(self.handle);
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn ack(&self, n: u32) {
        self.events_acked.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Events fired but not yet acknowledged.
    pub fn unacked_events(&self) -> u64 {
        self.events_delivered
            .load(Ordering::Relaxed)
            .saturating_sub(self.events_acked.load(Ordering::Relaxed))
    }

    pub fn poll(&self, out: &mut [WorkCompletion]) -> Result<usize> {
        if self.overrun.load(Ordering::Acquire) {
            return Err(FabricError::CqOverrun(self.handle));
        }
        let mut count = 0;
        while count < out.len() {
            match self.entries.pop() {
                Some(wc) => {
                    out[count] = wc;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcm_core::completion::WcOpcode;
    use rcm_core::handle::ConnId;

    fn cq(depth: u32) -> SoftCq {
        cq_on(depth).0
    }

    fn cq_on(depth: u32) -> (SoftCq, Arc<SoftChannel>) {
        let channel = Arc::new(SoftChannel::create(ChannelHandle(1)).unwrap());
        (SoftCq::new(CqHandle(2), depth, Arc::clone(&channel)), channel)
    }

    fn wc(n: u64) -> WorkCompletion {
        WorkCompletion::success(ConnId(n), WcOpcode::Recv, 1)
    }

    #[test]
    fn test_fifo_drain() {
        let cq = cq(4);
        cq.push(wc(1));
        cq.push(wc(2));
        let mut out = [WorkCompletion::EMPTY; 8];
        assert_eq!(cq.poll(&mut out).unwrap(), 2);
        assert_eq!(out[0].wr_id, ConnId(1));
        assert_eq!(out[1].wr_id, ConnId(2));
        assert_eq!(cq.poll(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_one_shot_notification() {
        let (cq, channel) = cq_on(4);
        // Disarmed: nothing fires.
        cq.push(wc(1));
        assert_eq!(cq.unacked_events(), 0);

        cq.arm();
        cq.push(wc(2));
        cq.push(wc(3));
        assert_eq!(cq.unacked_events(), 1);
        assert_eq!(channel.wait().unwrap(), Some(CqHandle(2)));
        cq.ack(1);
        assert_eq!(cq.unacked_events(), 0);
    }

    #[test]
    fn test_overrun_is_reported() {
        let cq = cq(1);
        cq.push(wc(1));
        cq.push(wc(2));
        let mut out = [WorkCompletion::EMPTY; 4];
        assert!(matches!(cq.poll(&mut out), Err(FabricError::CqOverrun(CqHandle(2)))));
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let channel = Arc::new(SoftChannel::create(ChannelHandle(1)).unwrap());
        let waiter = {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || channel.wait())
        };
        channel.interrupt();
        assert_eq!(waiter.join().unwrap().unwrap(), None);
    }
}
