//! Connections and the table that owns them.
//!
//! Work requests carry a `ConnId`; the completion handler resolves it
//! through `ConnectionTable` instead of trusting a raw pointer. A
//! connection removed from the table can no longer be reached by a late
//! completion.
//!
//! Teardown releases the buffers through `take_buffers` while the
//! connection still exists, then drops it. `ConnectionTable::live` counts
//! connections not yet dropped, including ones mid-teardown.

use rcm_core::handle::{CmId, ConnId, QpHandle};
use rcm_core::work_request::{RecvWr, SendWr, Sge};

use crate::registrar::BufferPair;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Requested → Accepting → Established → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Requested,
    Accepting,
    Established,
    Closed,
}

/// Holds one slot of the table's live count until dropped.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(count))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One peer: its queue pair and registered buffers.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    cm_id: CmId,
    qp: QpHandle,
    /// `None` once released.
    buffers: Option<BufferPair>,
    send_sge: Sge,
    recv_sge: Sge,
    state: ConnState,
    _live: Option<LiveGuard>,
}

impl Connection {
    pub fn new(id: ConnId, cm_id: CmId, qp: QpHandle, buffers: BufferPair) -> Self {
        Self {
            id,
            cm_id,
            qp,
            send_sge: buffers.send.mr().sge(buffers.send.len() as u32),
            recv_sge: buffers.recv.mr().sge(buffers.recv.len() as u32),
            buffers: Some(buffers),
            state: ConnState::Requested,
            _live: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn cm_id(&self) -> CmId {
        self.cm_id
    }

    pub fn qp(&self) -> QpHandle {
        self.qp
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        log::trace!("{}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    /// Receive covering the whole receive buffer.
    pub fn recv_wr(&self) -> RecvWr {
        RecvWr {
            wr_id: self.id,
            sge: self.recv_sge,
        }
    }

    /// Signaled send covering the whole send buffer.
    pub fn send_wr(&self) -> SendWr {
        SendWr {
            wr_id: self.id,
            sge: self.send_sge,
            signaled: true,
        }
    }

    /// Copy `message` into the send buffer, truncated to leave room for a
    /// terminating NUL. Returns the bytes copied, 0 after release.
    ///
    /// # Safety
    ///
    /// No send may be outstanding on this connection.
    pub unsafe fn write_message(&self, message: &[u8]) -> usize {
        let Some(buffers) = self.buffers.as_ref() else {
            return 0;
        };
        let buf = buffers.send.region().as_mut_slice();
        let n = message.len().min(buf.len().saturating_sub(1));
        buf[..n].copy_from_slice(&message[..n]);
        if let Some(nul) = buf.get_mut(n) {
            *nul = 0;
        }
        n
    }

    /// The received message: at most `byte_len` bytes, never past the end
    /// of the buffer, cut at the first NUL. Empty after release.
    ///
    /// # Safety
    ///
    /// The receive posted on this connection must have completed.
    pub unsafe fn received(&self, byte_len: u32) -> &[u8] {
        let Some(buffers) = self.buffers.as_ref() else {
            return &[];
        };
        let buf = buffers.recv.region().as_slice();
        let bounded = &buf[..(byte_len as usize).min(buf.len())];
        bounded.split(|&b| b == 0).next().unwrap_or(bounded)
    }

    /// Hand the buffers over for release. The connection itself stays
    /// alive until dropped.
    pub fn take_buffers(&mut self) -> Option<BufferPair> {
        self.buffers.take()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.buffers.is_some() {
            log::warn!("{}: dropped with buffers still registered", self.id);
        }
    }
}

/// All live connections, keyed by `ConnId`.
pub struct ConnectionTable {
    next_id: AtomicU64,
    conns: Mutex<HashMap<ConnId, Connection>>,
    live: Arc<AtomicUsize>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Connection>> {
        self.conns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve an id for a connection about to be built.
    pub fn next_id(&self) -> ConnId {
        ConnId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, mut conn: Connection) {
        conn._live = Some(LiveGuard::new(&self.live));
        self.lock().insert(conn.id(), conn);
    }

    /// Run `f` on the connection with the table locked.
    pub fn with<R>(&self, id: ConnId, f: impl FnOnce(&Connection) -> R) -> Option<R> {
        self.lock().get(&id).map(f)
    }

    pub fn with_mut<R>(&self, id: ConnId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.lock().get_mut(&id).map(f)
    }

    pub fn remove(&self, id: ConnId) -> Option<Connection> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Connections inserted and not yet dropped, whether or not they are
    /// still in the table.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
