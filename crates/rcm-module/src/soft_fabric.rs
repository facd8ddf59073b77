//! `SoftFabric` — default `Fabric` implementation.
//!
//! A software reliable-connected transport. Connection management rides on
//! TCP: an accepted stream is a connection request, the `ACCEPT`/`READY`
//! exchange establishes it, EOF disconnects it. Work requests are carried
//! as `DATA` frames (see `wire`).
//!
//! Threads:
//! - `rcm-soft-accept`: turns TCP connections into connection requests.
//! - `rcm-soft-rx-N`: one per identity, places inbound `DATA` into posted
//!   receives and raises `Established` / `Disconnected`.
//!
//! Sends are written synchronously from `post_send` and complete at once.
//! Inbound data arriving with no receive posted is held until one is.

use rcm_core::completion::{WcOpcode, WcStatus, WorkCompletion};
use rcm_core::error::{FabricError, Result};
use rcm_core::event::{CmEvent, CmEventKind, PendingEvent};
use rcm_core::fabric::{CmProvider, VerbsProvider};
use rcm_core::handle::{ChannelHandle, CmId, CqHandle, EndpointId, PdHandle, QpHandle};
use rcm_core::work_request::{access, MemoryRegion, QpCaps, QpInitAttr, RawRegion, RecvWr, SendWr, Sge};

use crate::soft_cq::{SoftChannel, SoftCq};
use crate::wire::{self, Frame};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;

/// The single endpoint a soft fabric exposes.
pub const SOFT_ENDPOINT: EndpointId = EndpointId(0);

enum Signal {
    Event(CmEvent),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdState {
    Requested,
    Accepted,
    Established,
    Disconnected,
}

struct SoftId {
    stream: TcpStream,
    state: IdState,
    qp: Option<Arc<SoftQp>>,
}

struct QpState {
    recvs: VecDeque<RecvWr>,
    /// Inbound payloads waiting for a receive.
    backlog: VecDeque<Vec<u8>>,
    writer: TcpStream,
    destroyed: bool,
}

struct SoftQp {
    handle: QpHandle,
    pd: PdHandle,
    send_cq: Arc<SoftCq>,
    recv_cq: Arc<SoftCq>,
    cap: QpCaps,
    state: Mutex<QpState>,
}

impl SoftQp {
    /// Copy `payload` into the buffer of `wr` and complete it.
    ///
    /// Called with the state lock held, so `destroy` cannot interleave.
    fn place(&self, wr: RecvWr, payload: &[u8]) {
        if payload.len() > wr.sge.length as usize {
            log::warn!(
                "{}: {} byte message exceeds {} byte receive",
                self.handle,
                payload.len(),
                wr.sge.length
            );
            self.recv_cq
                .push(WorkCompletion::failed(wr.wr_id, WcOpcode::Recv, WcStatus::LocalLength));
            return;
        }
        // Safety: the SGE was validated against a live registration at post
        // time, and the registrant keeps the memory until this QP is destroyed.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), wr.sge.addr as *mut u8, payload.len());
        }
        self.recv_cq
            .push(WorkCompletion::success(wr.wr_id, WcOpcode::Recv, payload.len() as u32));
    }

    fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        let mut st = lock(&self.state);
        if st.destroyed {
            return Err(FabricError::call("ibv_post_recv", format!("{} destroyed", self.handle)));
        }
        if st.recvs.len() >= self.cap.max_recv_wr as usize {
            return Err(FabricError::call("ibv_post_recv", "receive queue full"));
        }
        match st.backlog.pop_front() {
            Some(payload) => self.place(*wr, &payload),
            None => st.recvs.push_back(*wr),
        }
        Ok(())
    }

    fn post_send(&self, wr: &SendWr) -> Result<()> {
        let mut st = lock(&self.state);
        if st.destroyed {
            return Err(FabricError::call("ibv_post_send", format!("{} destroyed", self.handle)));
        }
        // Safety: validated against a live registration by the caller.
        let bytes = unsafe {
            std::slice::from_raw_parts(wr.sge.addr as *const u8, wr.sge.length as usize)
        }
        .to_vec();
        let status = match wire::write_frame(&mut st.writer, &Frame::Data(bytes)) {
            Ok(()) => WcStatus::Success,
            Err(e) => {
                log::warn!("{}: send failed: {}", self.handle, e);
                WcStatus::RetryExceeded
            }
        };
        if wr.signaled {
            self.send_cq.push(WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: WcOpcode::Send,
                byte_len: wr.sge.length,
            });
        }
        Ok(())
    }

    fn on_inbound(&self, payload: Vec<u8>) {
        let mut st = lock(&self.state);
        if st.destroyed {
            return;
        }
        match st.recvs.pop_front() {
            Some(wr) => self.place(wr, &payload),
            None => {
                log::debug!("{}: no receive posted, holding {} bytes", self.handle, payload.len());
                st.backlog.push_back(payload);
            }
        }
    }

    /// Stop touching registered memory. Outstanding receives are dropped
    /// without flush completions.
    fn destroy(&self) {
        let mut st = lock(&self.state);
        st.destroyed = true;
        st.recvs.clear();
        st.backlog.clear();
    }
}

#[derive(Default)]
struct Objects {
    pds: HashSet<PdHandle>,
    channels: HashMap<ChannelHandle, Arc<SoftChannel>>,
    cqs: HashMap<CqHandle, Arc<SoftCq>>,
    qps: HashMap<QpHandle, Arc<SoftQp>>,
    mrs: HashMap<u32, (PdHandle, MemoryRegion)>,
    ids: HashMap<CmId, SoftId>,
}

impl Objects {
    /// Check that `sge` lies in a region of `pd` with `needs` access.
    fn check_sge(&self, call: &'static str, pd: PdHandle, sge: &Sge, needs: u32) -> Result<()> {
        let (mr_pd, mr) = self
            .mrs
            .get(&sge.lkey)
            .ok_or_else(|| FabricError::call(call, format!("unknown lkey {:#x}", sge.lkey)))?;
        if *mr_pd != pd {
            return Err(FabricError::call(call, format!("lkey {:#x} belongs to {}", sge.lkey, mr_pd)));
        }
        if !mr.contains(sge.addr, sge.length) {
            return Err(FabricError::call(call, "sge outside memory region"));
        }
        if mr.access & needs != needs {
            return Err(FabricError::call(call, "memory region lacks access"));
        }
        Ok(())
    }

    fn qp(&self, call: &'static str, qp: QpHandle) -> Result<Arc<SoftQp>> {
        self.qps
            .get(&qp)
            .cloned()
            .ok_or_else(|| FabricError::call(call, format!("unknown {}", qp)))
    }

    fn cq(&self, call: &'static str, cq: CqHandle) -> Result<Arc<SoftCq>> {
        self.cqs
            .get(&cq)
            .cloned()
            .ok_or_else(|| FabricError::call(call, format!("unknown {}", cq)))
    }

    fn channel(&self, call: &'static str, ch: ChannelHandle) -> Result<Arc<SoftChannel>> {
        self.channels
            .get(&ch)
            .cloned()
            .ok_or_else(|| FabricError::call(call, format!("unknown {}", ch)))
    }
}

struct Shared {
    endpoint: EndpointId,
    next_id: AtomicU64,
    next_handle: AtomicU32,
    next_key: AtomicU32,
    objects: Mutex<Objects>,
    events_tx: mpsc::Sender<Signal>,
    events_rx: Mutex<mpsc::Receiver<Signal>>,
    /// Events handed out by `get_event` and not yet acknowledged.
    outstanding: AtomicUsize,
    shutdown: AtomicBool,
    backlog: AtomicU32,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn emit(&self, kind: CmEventKind, id: CmId) {
        log::debug!("soft: {} on {}", kind, id);
        let _ = self.events_tx.send(Signal::Event(CmEvent::new(kind, id, self.endpoint)));
    }

    fn handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_endpoint(&self, call: &'static str, endpoint: EndpointId) -> Result<()> {
        if endpoint != self.endpoint {
            return Err(FabricError::call(call, format!("no such device {}", endpoint)));
        }
        Ok(())
    }

    fn on_ready(&self, id: CmId) {
        let mut objs = lock(&self.objects);
        match objs.ids.get_mut(&id) {
            Some(sid) if sid.state == IdState::Accepted => {
                sid.state = IdState::Established;
                drop(objs);
                self.emit(CmEventKind::Established, id);
            }
            Some(sid) => log::warn!("soft: {} READY in state {:?}", id, sid.state),
            None => {}
        }
    }

    fn on_data(&self, id: CmId, payload: Vec<u8>) {
        let qp = lock(&self.objects).ids.get(&id).and_then(|sid| sid.qp.clone());
        match qp {
            Some(qp) => qp.on_inbound(payload),
            None => log::warn!("soft: {} sent data with no queue pair", id),
        }
    }

    fn on_peer_gone(&self, id: CmId) {
        let mut objs = lock(&self.objects);
        if let Some(sid) = objs.ids.get_mut(&id) {
            if sid.state != IdState::Disconnected {
                sid.state = IdState::Disconnected;
                drop(objs);
                self.emit(CmEventKind::Disconnected, id);
            }
        }
    }
}

fn on_incoming(shared: &Arc<Shared>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("soft: cannot clone stream from {:?}: {}", peer, e);
            return;
        }
    };
    let id = CmId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    {
        let mut objs = lock(&shared.objects);
        let pending = objs.ids.values().filter(|s| s.state == IdState::Requested).count();
        if pending >= shared.backlog.load(Ordering::Relaxed) as usize {
            log::warn!("soft: backlog full, rejecting {:?}", peer);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        objs.ids.insert(
            id,
            SoftId {
                stream,
                state: IdState::Requested,
                qp: None,
            },
        );
    }
    log::debug!("soft: connection request {} from {:?}", id, peer);
    // The request must be queued before the reader can report a disconnect.
    shared.emit(CmEventKind::ConnectRequest, id);

    let rx_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("rcm-soft-rx-{}", id.raw()))
        .spawn(move || reader_loop(rx_shared, id, reader));
    if let Err(e) = spawned {
        log::error!("soft: cannot spawn reader for {}: {}", id, e);
        shared.on_peer_gone(id);
    }
}

fn reader_loop(shared: Arc<Shared>, id: CmId, mut stream: TcpStream) {
    loop {
        let frame = match wire::read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::debug!("soft: {} read error: {}", id, e);
                break;
            }
        };
        match frame {
            Frame::Ready => shared.on_ready(id),
            Frame::Data(payload) => shared.on_data(id, payload),
            Frame::Disconnect => break,
            Frame::Accept => log::warn!("soft: {} unexpected ACCEPT from peer", id),
        }
    }
    shared.on_peer_gone(id);
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    for stream in listener.incoming() {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => on_incoming(&shared, stream),
            Err(e) => log::warn!("soft: accept failed: {}", e),
        }
    }
    log::debug!("soft: accept loop exited");
}

/// Software reliable-connected fabric over TCP.
pub struct SoftFabric {
    shared: Arc<Shared>,
}

impl SoftFabric {
    pub fn new() -> Self {
        Self::with_endpoint(SOFT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: EndpointId) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                endpoint,
                next_id: AtomicU64::new(1),
                next_handle: AtomicU32::new(1),
                next_key: AtomicU32::new(0x100),
                objects: Mutex::new(Objects::default()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                outstanding: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                backlog: AtomicU32::new(0),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.shared.endpoint
    }

    /// Connection-management events handed out but not acknowledged.
    pub fn unacked_events(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Memory regions currently registered.
    pub fn registered_regions(&self) -> usize {
        lock(&self.shared.objects).mrs.len()
    }

    /// Live transport identities (excluding the listener).
    pub fn live_ids(&self) -> usize {
        lock(&self.shared.objects).ids.len()
    }
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl CmProvider for SoftFabric {
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).map_err(|e| FabricError::os("rdma_bind_addr", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| FabricError::os("rdma_get_src_port", e))?;
        self.shared.backlog.store(backlog.max(1), Ordering::Relaxed);
        *lock(&self.shared.local_addr) = Some(local);

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("rcm-soft-accept".into())
            .spawn(move || accept_loop(shared, listener))
            .map_err(|e| FabricError::os("rdma_listen", e))?;
        log::info!("soft: listening on {} (backlog {})", local, backlog);
        Ok(local)
    }

    fn get_event(&self) -> Result<Option<PendingEvent>> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }
        let signal = lock(&self.shared.events_rx).recv();
        match signal {
            Ok(Signal::Event(event)) => {
                self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
                Ok(Some(PendingEvent::new(event.id.raw(), event)))
            }
            Ok(Signal::Shutdown) | Err(_) => Ok(None),
        }
    }

    fn ack_event(&self, event: PendingEvent) -> Result<()> {
        self.shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                let id = event.event().id;
                FabricError::call("rdma_ack_cm_event", format!("no event outstanding for {}", id))
            })
    }

    /// A peer that already went away is not an error: its `Disconnected`
    /// event is queued (or queued here) and drives the teardown.
    fn accept(&self, id: CmId) -> Result<()> {
        let mut objs = lock(&self.shared.objects);
        let sid = objs
            .ids
            .get_mut(&id)
            .ok_or_else(|| FabricError::call("rdma_accept", format!("unknown {}", id)))?;
        match sid.state {
            IdState::Requested => {}
            IdState::Disconnected => {
                log::debug!("soft: {} left before accept", id);
                return Ok(());
            }
            state => {
                return Err(FabricError::call("rdma_accept", format!("{} in state {:?}", id, state)))
            }
        }
        if sid.qp.is_none() {
            return Err(FabricError::call("rdma_accept", format!("{} has no queue pair", id)));
        }
        if let Err(e) = wire::write_frame(&mut sid.stream, &Frame::Accept) {
            log::debug!("soft: {} gone during accept: {}", id, e);
            drop(objs);
            self.shared.on_peer_gone(id);
            return Ok(());
        }
        sid.state = IdState::Accepted;
        Ok(())
    }

    fn destroy_id(&self, id: CmId) -> Result<()> {
        let mut objs = lock(&self.shared.objects);
        match objs.ids.get(&id) {
            None => return Err(FabricError::call("rdma_destroy_id", format!("unknown {}", id))),
            Some(sid) if sid.qp.is_some() => {
                return Err(FabricError::call(
                    "rdma_destroy_id",
                    format!("{} still has a queue pair", id),
                ))
            }
            Some(_) => {}
        }
        if let Some(sid) = objs.ids.remove(&id) {
            // Ends the reader thread; it finds the id gone and stays quiet.
            let _ = sid.stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn shutdown_events(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.events_tx.send(Signal::Shutdown);
        // Unblock the accept thread so it can observe the flag.
        if let Some(addr) = *lock(&self.shared.local_addr) {
            let _ = TcpStream::connect(addr);
        }
    }
}

impl VerbsProvider for SoftFabric {
    fn alloc_pd(&self, endpoint: EndpointId) -> Result<PdHandle> {
        self.shared.check_endpoint("ibv_alloc_pd", endpoint)?;
        let pd = PdHandle(self.shared.handle());
        lock(&self.shared.objects).pds.insert(pd);
        Ok(pd)
    }

    fn create_comp_channel(&self, endpoint: EndpointId) -> Result<ChannelHandle> {
        self.shared.check_endpoint("ibv_create_comp_channel", endpoint)?;
        let ch = ChannelHandle(self.shared.handle());
        let channel = Arc::new(SoftChannel::create(ch)?);
        lock(&self.shared.objects).channels.insert(ch, channel);
        Ok(ch)
    }

    fn create_cq(&self, endpoint: EndpointId, depth: u32, channel: ChannelHandle) -> Result<CqHandle> {
        self.shared.check_endpoint("ibv_create_cq", endpoint)?;
        if depth == 0 {
            return Err(FabricError::call("ibv_create_cq", "zero depth"));
        }
        let mut objs = lock(&self.shared.objects);
        let channel = objs.channel("ibv_create_cq", channel)?;
        let cq = CqHandle(self.shared.handle());
        objs.cqs.insert(cq, Arc::new(SoftCq::new(cq, depth, channel)));
        Ok(cq)
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<()> {
        lock(&self.shared.objects).cq("ibv_req_notify_cq", cq)?.arm();
        Ok(())
    }

    fn get_cq_event(&self, channel: ChannelHandle) -> Result<Option<CqHandle>> {
        let channel = lock(&self.shared.objects).channel("ibv_get_cq_event", channel)?;
        channel.wait()
    }

    fn ack_cq_events(&self, cq: CqHandle, n: u32) {
        match lock(&self.shared.objects).cq("ibv_ack_cq_events", cq) {
            Ok(cq) => cq.ack(n),
            Err(e) => log::warn!("soft: {}", e),
        }
    }

    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize> {
        let cq = lock(&self.shared.objects).cq("ibv_poll_cq", cq)?;
        cq.poll(out)
    }

    fn interrupt_channel(&self, channel: ChannelHandle) {
        match lock(&self.shared.objects).channel("ibv_get_cq_event", channel) {
            Ok(channel) => channel.interrupt(),
            Err(e) => log::warn!("soft: {}", e),
        }
    }

    fn create_qp(&self, id: CmId, pd: PdHandle, attr: &QpInitAttr) -> Result<QpHandle> {
        let mut objs = lock(&self.shared.objects);
        if !objs.pds.contains(&pd) {
            return Err(FabricError::call("rdma_create_qp", format!("unknown {}", pd)));
        }
        let send_cq = objs.cq("rdma_create_qp", attr.send_cq)?;
        let recv_cq = objs.cq("rdma_create_qp", attr.recv_cq)?;
        let handle = QpHandle(self.shared.handle());
        let sid = objs
            .ids
            .get_mut(&id)
            .ok_or_else(|| FabricError::call("rdma_create_qp", format!("unknown {}", id)))?;
        if sid.qp.is_some() {
            return Err(FabricError::call("rdma_create_qp", format!("{} already has a queue pair", id)));
        }
        let writer = sid
            .stream
            .try_clone()
            .map_err(|e| FabricError::os("rdma_create_qp", e))?;
        let qp = Arc::new(SoftQp {
            handle,
            pd,
            send_cq,
            recv_cq,
            cap: attr.cap,
            state: Mutex::new(QpState {
                recvs: VecDeque::new(),
                backlog: VecDeque::new(),
                writer,
                destroyed: false,
            }),
        });
        sid.qp = Some(Arc::clone(&qp));
        objs.qps.insert(handle, qp);
        Ok(handle)
    }

    fn destroy_qp(&self, id: CmId) -> Result<()> {
        let qp = {
            let mut objs = lock(&self.shared.objects);
            let qp = objs
                .ids
                .get_mut(&id)
                .and_then(|sid| sid.qp.take())
                .ok_or_else(|| FabricError::call("rdma_destroy_qp", format!("{} has no queue pair", id)))?;
            objs.qps.remove(&qp.handle);
            qp
        };
        qp.destroy();
        Ok(())
    }

    unsafe fn reg_mr(&self, pd: PdHandle, region: RawRegion, access: u32) -> Result<MemoryRegion> {
        if region.ptr.is_null() || region.len == 0 {
            return Err(FabricError::call("ibv_reg_mr", "empty region"));
        }
        let mut objs = lock(&self.shared.objects);
        if !objs.pds.contains(&pd) {
            return Err(FabricError::call("ibv_reg_mr", format!("unknown {}", pd)));
        }
        let lkey = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        let mr = MemoryRegion {
            lkey,
            rkey: lkey ^ 0x8000_0000,
            addr: region.ptr as u64,
            length: region.len,
            access,
        };
        objs.mrs.insert(lkey, (pd, mr));
        Ok(mr)
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()> {
        lock(&self.shared.objects)
            .mrs
            .remove(&mr.lkey)
            .map(|_| ())
            .ok_or_else(|| FabricError::call("ibv_dereg_mr", format!("unknown lkey {:#x}", mr.lkey)))
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<()> {
        let qp = {
            let objs = lock(&self.shared.objects);
            let qp = objs.qp("ibv_post_recv", qp)?;
            objs.check_sge("ibv_post_recv", qp.pd, &wr.sge, access::LOCAL_WRITE)?;
            qp
        };
        qp.post_recv(wr)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<()> {
        let qp = {
            let objs = lock(&self.shared.objects);
            let qp = objs.qp("ibv_post_send", qp)?;
            objs.check_sge("ibv_post_send", qp.pd, &wr.sge, 0)?;
            qp
        };
        qp.post_send(wr)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
