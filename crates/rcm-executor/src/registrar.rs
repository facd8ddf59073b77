//! Memory Registrar: per-connection send and receive buffers.
//!
//! Each buffer is a zeroed `HeapRegion` registered against the context's
//! protection domain with local-write and remote-write access. `release`
//! deregisters both regions before freeing either buffer.

use rcm_core::error::Result;
use rcm_core::fabric::Fabric;
use rcm_core::handle::PdHandle;
use rcm_core::work_request::{access, MemoryRegion};
use rcm_module::HeapRegion;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Access granted to every per-connection region.
pub const BUFFER_ACCESS: u32 = access::LOCAL_WRITE | access::REMOTE_WRITE;

/// A buffer and its registration.
#[derive(Debug)]
pub struct RegisteredBuffer {
    region: HeapRegion,
    mr: MemoryRegion,
}

impl RegisteredBuffer {
    pub fn region(&self) -> &HeapRegion {
        &self.region
    }

    pub fn mr(&self) -> &MemoryRegion {
        &self.mr
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

/// The two buffers of one connection.
#[derive(Debug)]
pub struct BufferPair {
    pub send: RegisteredBuffer,
    pub recv: RegisteredBuffer,
}

/// Live counters, shared with whoever wants to watch for leaks.
#[derive(Debug, Default)]
pub struct RegistrarStats {
    registered: AtomicUsize,
    deregistered: AtomicUsize,
    live_buffers: AtomicUsize,
}

impl RegistrarStats {
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Relaxed)
    }

    pub fn deregistered(&self) -> usize {
        self.deregistered.load(Ordering::Relaxed)
    }

    /// Buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }
}

pub struct MemoryRegistrar<F: Fabric> {
    fabric: Arc<F>,
    buffer_size: usize,
    stats: Arc<RegistrarStats>,
}

impl<F: Fabric> MemoryRegistrar<F> {
    pub fn new(fabric: Arc<F>, buffer_size: usize, stats: Arc<RegistrarStats>) -> Self {
        Self {
            fabric,
            buffer_size,
            stats,
        }
    }

    /// Allocate and register the send and receive buffers.
    pub fn register(&self, pd: PdHandle) -> Result<BufferPair> {
        let send = self.register_one(pd)?;
        let recv = match self.register_one(pd) {
            Ok(recv) => recv,
            Err(e) => {
                if let Err(dereg) = self.release_one(send) {
                    log::warn!("registrar: cleanup after failed registration: {}", dereg);
                }
                return Err(e);
            }
        };
        Ok(BufferPair { send, recv })
    }

    fn register_one(&self, pd: PdHandle) -> Result<RegisteredBuffer> {
        let region = HeapRegion::alloc_zeroed(self.buffer_size)?;
        self.stats.live_buffers.fetch_add(1, Ordering::Relaxed);
        // Safety: the region is owned by the returned RegisteredBuffer, and
        // `release` is only called after the queue pair that could reference
        // it has been destroyed.
        let mr = match unsafe { self.fabric.reg_mr(pd, region.raw(), BUFFER_ACCESS) } {
            Ok(mr) => mr,
            Err(e) => {
                self.free(region);
                return Err(e);
            }
        };
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        log::trace!("registrar: {:?} lkey {:#x}", region, mr.lkey);
        Ok(RegisteredBuffer { region, mr })
    }

    /// Deregister both regions, then free both buffers.
    ///
    /// The queue pair that used them must already be destroyed.
    pub fn release(&self, pair: BufferPair) -> Result<()> {
        let BufferPair { send, recv } = pair;
        let send_res = self.deregister(&send);
        let recv_res = self.deregister(&recv);
        self.free(send.region);
        self.free(recv.region);
        send_res.and(recv_res)
    }

    fn release_one(&self, buf: RegisteredBuffer) -> Result<()> {
        let res = self.deregister(&buf);
        self.free(buf.region);
        res
    }

    fn deregister(&self, buf: &RegisteredBuffer) -> Result<()> {
        self.fabric.dereg_mr(buf.mr)?;
        self.stats.deregistered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, region: HeapRegion) {
        region.release();
        self.stats.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcm_core::fabric::VerbsProvider;
    use rcm_core::handle::EndpointId;
    use rcm_module::{Call, MockFabric};

    fn setup() -> (Arc<MockFabric>, MemoryRegistrar<MockFabric>, Arc<RegistrarStats>, PdHandle) {
        let fabric = Arc::new(MockFabric::new());
        let pd = fabric.alloc_pd(EndpointId(0)).unwrap();
        let stats = Arc::new(RegistrarStats::default());
        let registrar = MemoryRegistrar::new(Arc::clone(&fabric), 1024, Arc::clone(&stats));
        (fabric, registrar, stats, pd)
    }

    #[test]
    fn test_register_and_release() {
        let (fabric, registrar, stats, pd) = setup();
        let pair = registrar.register(pd).unwrap();
        assert_eq!(pair.send.len(), 1024);
        assert_eq!(pair.recv.mr().access, BUFFER_ACCESS);
        assert_ne!(pair.send.mr().lkey, pair.recv.mr().lkey);
        assert_eq!(stats.live_buffers(), 2);

        registrar.release(pair).unwrap();
        assert_eq!(stats.live_buffers(), 0);
        assert_eq!(stats.registered(), 2);
        assert_eq!(stats.deregistered(), 2);
        assert_eq!(fabric.reg_count(), fabric.dereg_count());

        let regs = fabric
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::RegMr { len: 1024, .. }))
            .count();
        assert_eq!(regs, 2);
    }

    #[test]
    fn test_failed_registration_frees_buffer() {
        let (fabric, registrar, stats, pd) = setup();
        fabric.fail_on("ibv_reg_mr", "out of keys");
        assert!(registrar.register(pd).is_err());
        assert_eq!(stats.live_buffers(), 0);
    }
}
