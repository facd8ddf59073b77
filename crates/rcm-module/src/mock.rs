//! `MockFabric` — scripted fabric for tests.
//!
//! Connection-management events are pushed by the test and handed out in
//! order. Completions are injected by the test (`deliver_recv`,
//! `push_completion`) or produced by `post_send`. Every capability call is
//! appended to a journal so tests can assert on ordering.
//!
//! Notification behaves like hardware: a completion added while the queue
//! is armed fires the channel once and disarms it.

use rcm_core::completion::{WcOpcode, WcStatus, WorkCompletion};
use rcm_core::error::{FabricError, Result};
use rcm_core::event::{CmEvent, CmEventKind, PendingEvent};
use rcm_core::fabric::{CmProvider, VerbsProvider};
use rcm_core::handle::{ChannelHandle, CmId, CqHandle, EndpointId, PdHandle, QpHandle};
use rcm_core::work_request::{MemoryRegion, QpCaps, QpInitAttr, RawRegion, RecvWr, SendWr};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// One journaled capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Listen { backlog: u32 },
    AckEvent(CmId),
    Accept(CmId),
    DestroyId(CmId),
    AllocPd(EndpointId),
    CreateCompChannel(EndpointId),
    CreateCq { endpoint: EndpointId, depth: u32 },
    ReqNotifyCq(CqHandle),
    AckCqEvents { cq: CqHandle, n: u32 },
    CreateQp { id: CmId, pd: PdHandle, cap: QpCaps },
    DestroyQp(CmId),
    RegMr { pd: PdHandle, len: usize, access: u32 },
    DeregMr { lkey: u32 },
    PostRecv { qp: QpHandle, wr: RecvWr },
    PostSend { qp: QpHandle, wr: SendWr },
}

struct MockCq {
    depth: usize,
    channel: ChannelHandle,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    overrun: bool,
}

struct MockQp {
    handle: QpHandle,
    cq: CqHandle,
    recvs: VecDeque<RecvWr>,
}

type Hook = Box<dyn Fn(&Call) + Send + Sync>;

struct State {
    calls: Vec<Call>,
    endpoint: EndpointId,
    events: VecDeque<CmEvent>,
    events_closed: bool,
    shutdown: bool,
    unacked: HashSet<u64>,
    next_token: u64,
    next_handle: u32,
    channels: HashSet<ChannelHandle>,
    fired: HashMap<ChannelHandle, VecDeque<CqHandle>>,
    interrupted: HashSet<ChannelHandle>,
    cqs: HashMap<CqHandle, MockCq>,
    last_cq: Option<CqHandle>,
    qps: HashMap<CmId, MockQp>,
    mrs: HashMap<u32, MemoryRegion>,
    reg_count: usize,
    dereg_count: usize,
    sent: Vec<(CmId, Vec<u8>)>,
    send_status: Option<WcStatus>,
    failing: HashMap<&'static str, String>,
}

impl State {
    fn new() -> Self {
        Self {
            calls: Vec::new(),
            endpoint: EndpointId(0),
            events: VecDeque::new(),
            events_closed: false,
            shutdown: false,
            unacked: HashSet::new(),
            next_token: 0,
            next_handle: 0,
            channels: HashSet::new(),
            fired: HashMap::new(),
            interrupted: HashSet::new(),
            cqs: HashMap::new(),
            last_cq: None,
            qps: HashMap::new(),
            mrs: HashMap::new(),
            reg_count: 0,
            dereg_count: 0,
            sent: Vec::new(),
            send_status: Some(WcStatus::Success),
            failing: HashMap::new(),
        }
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check(&self, call: &'static str) -> Result<()> {
        match self.failing.get(call) {
            Some(reason) => Err(FabricError::call(call, reason.clone())),
            None => Ok(()),
        }
    }

    /// Queue a completion on `cq`. True if the channel fired.
    fn complete(&mut self, cq: CqHandle, wc: WorkCompletion) -> bool {
        let Some(q) = self.cqs.get_mut(&cq) else {
            return false;
        };
        if q.entries.len() >= q.depth {
            q.overrun = true;
        } else {
            q.entries.push_back(wc);
        }
        if q.armed {
            q.armed = false;
            let channel = q.channel;
            self.fired.entry(channel).or_default().push_back(cq);
            return true;
        }
        false
    }

    fn id_of_qp(&self, qp: QpHandle) -> Option<CmId> {
        self.qps
            .iter()
            .find_map(|(id, q)| (q.handle == qp).then_some(*id))
    }
}

/// Scripted, journaling fabric.
pub struct MockFabric {
    state: Mutex<State>,
    events_cv: Condvar,
    cq_cv: Condvar,
    teardown_hook: Mutex<Option<Hook>>,
}

impl MockFabric {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::new()),
            events_cv: Condvar::new(),
            cq_cv: Condvar::new(),
            teardown_hook: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event on the default endpoint.
    pub fn push_event(&self, kind: CmEventKind, id: CmId) {
        let endpoint = self.lock().endpoint;
        self.push_event_on(kind, id, endpoint);
    }

    /// Queue an event reporting `endpoint`.
    pub fn push_event_on(&self, kind: CmEventKind, id: CmId, endpoint: EndpointId) {
        self.lock().events.push_back(CmEvent::new(kind, id, endpoint));
        self.events_cv.notify_all();
    }

    /// Once the queued events are consumed, `get_event` returns `None`.
    pub fn close_events(&self) {
        self.lock().events_closed = true;
        self.events_cv.notify_all();
    }

    /// Add a completion to the most recently created queue.
    ///
    /// Returns false if no queue exists yet.
    pub fn push_completion(&self, wc: WorkCompletion) -> bool {
        let mut st = self.lock();
        let Some(cq) = st.last_cq else {
            return false;
        };
        if st.complete(cq, wc) {
            self.cq_cv.notify_all();
        }
        true
    }

    /// Place `payload` into the oldest receive posted for `id`, as if the
    /// peer had sent it, and complete that receive.
    ///
    /// Returns false if `id` has no queue pair or no receive is posted.
    pub fn deliver_recv(&self, id: CmId, payload: &[u8]) -> bool {
        let mut st = self.lock();
        let Some(qp) = st.qps.get_mut(&id) else {
            return false;
        };
        let Some(wr) = qp.recvs.pop_front() else {
            return false;
        };
        let cq = qp.cq;
        let wc = if payload.len() > wr.sge.length as usize {
            WorkCompletion::failed(wr.wr_id, WcOpcode::Recv, WcStatus::LocalLength)
        } else {
            // Safety: the receive was posted against a region the executor
            // keeps alive until the queue pair is destroyed, which also
            // removes it from `qps`.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), wr.sge.addr as *mut u8, payload.len());
            }
            WorkCompletion::success(wr.wr_id, WcOpcode::Recv, payload.len() as u32)
        };
        if st.complete(cq, wc) {
            self.cq_cv.notify_all();
        }
        true
    }

    /// Status reported for sends from now on. `None` stops completing
    /// sends at all.
    pub fn set_send_status(&self, status: Option<WcStatus>) {
        self.lock().send_status = status;
    }

    /// Make every later call named `call` fail.
    pub fn fail_on(&self, call: &'static str, reason: &str) {
        self.lock().failing.insert(call, reason.to_string());
    }

    /// Run `hook` on entry to `destroy_qp`, `dereg_mr` and `destroy_id`,
    /// before the fabric acts on the call.
    pub fn set_teardown_hook(&self, hook: impl Fn(&Call) + Send + Sync + 'static) {
        *self
            .teardown_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Box::new(hook));
    }

    fn run_teardown_hook(&self, call: &Call) {
        if let Some(hook) = self
            .teardown_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            hook(call);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Bytes of every posted send, in order.
    pub fn sent(&self) -> Vec<(CmId, Vec<u8>)> {
        self.lock().sent.clone()
    }

    pub fn reg_count(&self) -> usize {
        self.lock().reg_count
    }

    pub fn dereg_count(&self) -> usize {
        self.lock().dereg_count
    }

    pub fn unacked_events(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Events pushed but not yet handed out.
    pub fn pending_events(&self) -> usize {
        self.lock().events.len()
    }

    /// Wait until the journal satisfies `pred` or `timeout` passes.
    pub fn wait_for_call(&self, timeout: Duration, pred: impl Fn(&Call) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.lock().calls.iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Default for MockFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl CmProvider for MockFabric {
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        let mut st = self.lock();
        st.check("rdma_listen")?;
        st.calls.push(Call::Listen { backlog });
        let mut bound = addr;
        if bound.port() == 0 {
            bound.set_port(20079);
        }
        Ok(bound)
    }

    fn get_event(&self) -> Result<Option<PendingEvent>> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return Ok(None);
            }
            if let Some(event) = st.events.pop_front() {
                st.next_token += 1;
                let token = st.next_token;
                st.unacked.insert(token);
                return Ok(Some(PendingEvent::new(token, event)));
            }
            if st.events_closed {
                return Ok(None);
            }
            st = self
                .events_cv
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn ack_event(&self, event: PendingEvent) -> Result<()> {
        let mut st = self.lock();
        if !st.unacked.remove(&event.token()) {
            return Err(FabricError::call("rdma_ack_cm_event", "event not outstanding"));
        }
        st.calls.push(Call::AckEvent(event.event().id));
        Ok(())
    }

    fn accept(&self, id: CmId) -> Result<()> {
        let mut st = self.lock();
        st.check("rdma_accept")?;
        st.calls.push(Call::Accept(id));
        Ok(())
    }

    fn destroy_id(&self, id: CmId) -> Result<()> {
        self.run_teardown_hook(&Call::DestroyId(id));
        let mut st = self.lock();
        st.check("rdma_destroy_id")?;
        st.calls.push(Call::DestroyId(id));
        Ok(())
    }

    fn shutdown_events(&self) {
        self.lock().shutdown = true;
        self.events_cv.notify_all();
    }
}

impl VerbsProvider for MockFabric {
    fn alloc_pd(&self, endpoint: EndpointId) -> Result<PdHandle> {
        let mut st = self.lock();
        st.check("ibv_alloc_pd")?;
        st.calls.push(Call::AllocPd(endpoint));
        Ok(PdHandle(st.handle()))
    }

    fn create_comp_channel(&self, endpoint: EndpointId) -> Result<ChannelHandle> {
        let mut st = self.lock();
        st.check("ibv_create_comp_channel")?;
        st.calls.push(Call::CreateCompChannel(endpoint));
        let ch = ChannelHandle(st.handle());
        st.channels.insert(ch);
        Ok(ch)
    }

    fn create_cq(&self, endpoint: EndpointId, depth: u32, channel: ChannelHandle) -> Result<CqHandle> {
        let mut st = self.lock();
        st.check("ibv_create_cq")?;
        if !st.channels.contains(&channel) {
            return Err(FabricError::call("ibv_create_cq", format!("unknown {}", channel)));
        }
        st.calls.push(Call::CreateCq { endpoint, depth });
        let cq = CqHandle(st.handle());
        st.cqs.insert(
            cq,
            MockCq {
                depth: depth as usize,
                channel,
                entries: VecDeque::new(),
                armed: false,
                overrun: false,
            },
        );
        st.last_cq = Some(cq);
        Ok(cq)
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<()> {
        let mut st = self.lock();
        st.check("ibv_req_notify_cq")?;
        st.calls.push(Call::ReqNotifyCq(cq));
        let q = st
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| FabricError::call("ibv_req_notify_cq", format!("unknown {}", cq)))?;
        q.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, channel: ChannelHandle) -> Result<Option<CqHandle>> {
        let mut st = self.lock();
        loop {
            if st.interrupted.contains(&channel) {
                return Ok(None);
            }
            if let Some(cq) = st.fired.get_mut(&channel).and_then(|q| q.pop_front()) {
                return Ok(Some(cq));
            }
            st = self
                .cq_cv
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn ack_cq_events(&self, cq: CqHandle, n: u32) {
        self.lock().calls.push(Call::AckCqEvents { cq, n });
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize> {
        let mut st = self.lock();
        let q = st
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| FabricError::call("ibv_poll_cq", format!("unknown {}", cq)))?;
        if q.overrun {
            return Err(FabricError::CqOverrun(cq));
        }
        let mut n = 0;
        while n < out.len() {
            match q.entries.pop_front() {
                Some(wc) => {
                    out[n] = wc;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn interrupt_channel(&self, channel: ChannelHandle) {
        self.lock().interrupted.insert(channel);
        self.cq_cv.notify_all();
    }

    fn create_qp(&self, id: CmId, pd: PdHandle, attr: &QpInitAttr) -> Result<QpHandle> {
        let mut st = self.lock();
        st.check("rdma_create_qp")?;
        st.calls.push(Call::CreateQp { id, pd, cap: attr.cap });
        let handle = QpHandle(st.handle());
        st.qps.insert(
            id,
            MockQp {
                handle,
                cq: attr.recv_cq,
                recvs: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_qp(&self, id: CmId) -> Result<()> {
        self.run_teardown_hook(&Call::DestroyQp(id));
        let mut st = self.lock();
        st.check("rdma_destroy_qp")?;
        st.calls.push(Call::DestroyQp(id));
        st.qps
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| FabricError::call("rdma_destroy_qp", format!("{} has no queue pair", id)))
    }

    unsafe fn reg_mr(&self, pd: PdHandle, region: RawRegion, access: u32) -> Result<MemoryRegion> {
        let mut st = self.lock();
        st.check("ibv_reg_mr")?;
        st.calls.push(Call::RegMr { pd, len: region.len, access });
        let lkey = st.handle();
        let mr = MemoryRegion {
            lkey,
            rkey: lkey,
            addr: region.ptr as u64,
            length: region.len,
            access,
        };
        st.mrs.insert(lkey, mr);
        st.reg_count += 1;
        Ok(mr)
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()> {
        self.run_teardown_hook(&Call::DeregMr { lkey: mr.lkey });
        let mut st = self.lock();
        st.check("ibv_dereg_mr")?;
        st.calls.push(Call::DeregMr { lkey: mr.lkey });
        if st.mrs.remove(&mr.lkey).is_none() {
            return Err(FabricError::call("ibv_dereg_mr", format!("unknown lkey {}", mr.lkey)));
        }
        st.dereg_count += 1;
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<()> {
        let mut st = self.lock();
        st.check("ibv_post_recv")?;
        st.calls.push(Call::PostRecv { qp, wr: *wr });
        let id = st
            .id_of_qp(qp)
            .ok_or_else(|| FabricError::call("ibv_post_recv", format!("unknown {}", qp)))?;
        if let Some(q) = st.qps.get_mut(&id) {
            q.recvs.push_back(*wr);
        }
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<()> {
        let mut st = self.lock();
        st.check("ibv_post_send")?;
        st.calls.push(Call::PostSend { qp, wr: *wr });
        let id = st
            .id_of_qp(qp)
            .ok_or_else(|| FabricError::call("ibv_post_send", format!("unknown {}", qp)))?;
        if !st.mrs.values().any(|mr| mr.lkey == wr.sge.lkey && mr.contains(wr.sge.addr, wr.sge.length)) {
            return Err(FabricError::call("ibv_post_send", "sge outside registered memory"));
        }
        // Safety: checked against a live registration above.
        let bytes = unsafe {
            std::slice::from_raw_parts(wr.sge.addr as *const u8, wr.sge.length as usize)
        }
        .to_vec();
        st.sent.push((id, bytes));
        let cq = st.qps.get(&id).map(|q| q.cq);
        if let (true, Some(cq), Some(status)) = (wr.signaled, cq, st.send_status) {
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: WcOpcode::Send,
                byte_len: wr.sge.length,
            };
            if st.complete(cq, wc) {
                self.cq_cv.notify_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcm_core::handle::ConnId;

    #[test]
    fn test_events_in_order_then_closed() {
        let mock = MockFabric::new();
        mock.push_event(CmEventKind::ConnectRequest, CmId(1));
        mock.push_event_on(CmEventKind::Established, CmId(1), EndpointId(3));
        mock.close_events();

        let first = mock.receive_next_event().unwrap().unwrap();
        assert_eq!(first.kind, CmEventKind::ConnectRequest);
        let second = mock.receive_next_event().unwrap().unwrap();
        assert_eq!(second.endpoint, EndpointId(3));
        assert!(mock.receive_next_event().unwrap().is_none());
        assert_eq!(mock.unacked_events(), 0);
        assert_eq!(mock.calls(), vec![Call::AckEvent(CmId(1)), Call::AckEvent(CmId(1))]);
    }

    #[test]
    fn test_arm_fires_once() {
        let mock = MockFabric::new();
        let ch = mock.create_comp_channel(EndpointId(0)).unwrap();
        let cq = mock.create_cq(EndpointId(0), 4, ch).unwrap();
        mock.req_notify_cq(cq).unwrap();
        assert!(mock.push_completion(WorkCompletion::success(ConnId(1), WcOpcode::Send, 0)));
        assert!(mock.push_completion(WorkCompletion::success(ConnId(2), WcOpcode::Send, 0)));
        assert_eq!(mock.get_cq_event(ch).unwrap(), Some(cq));

        mock.interrupt_channel(ch);
        assert_eq!(mock.get_cq_event(ch).unwrap(), None);

        let mut out = [WorkCompletion::EMPTY; 4];
        assert_eq!(mock.poll_cq(cq, &mut out).unwrap(), 2);
    }

    #[test]
    fn test_depth_overrun() {
        let mock = MockFabric::new();
        let ch = mock.create_comp_channel(EndpointId(0)).unwrap();
        let cq = mock.create_cq(EndpointId(0), 1, ch).unwrap();
        mock.push_completion(WorkCompletion::success(ConnId(1), WcOpcode::Send, 0));
        mock.push_completion(WorkCompletion::success(ConnId(2), WcOpcode::Send, 0));
        let mut out = [WorkCompletion::EMPTY; 4];
        assert!(matches!(mock.poll_cq(cq, &mut out), Err(FabricError::CqOverrun(_))));
    }

    #[test]
    fn test_failure_injection() {
        let mock = MockFabric::new();
        mock.fail_on("ibv_alloc_pd", "no device");
        let err = mock.alloc_pd(EndpointId(0)).unwrap_err();
        assert_eq!(err.to_string(), "ibv_alloc_pd failed: no device");
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_shutdown_drops_pending_events() {
        let mock = MockFabric::new();
        mock.push_event(CmEventKind::ConnectRequest, CmId(1));
        mock.shutdown_events();
        assert!(mock.get_event().unwrap().is_none());
        assert_eq!(mock.pending_events(), 1);
    }
}
