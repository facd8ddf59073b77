//! Transport capability set.
//!
//! The executor never talks to a device directly. Everything it needs from
//! the fabric is listed here, split into the two halves a verbs stack
//! exposes: the connection manager (`CmProvider`) and the verbs proper
//! (`VerbsProvider`).
//!
//! # Implementors
//!
//! - `SoftFabric` (default): software reliable-connected transport over
//!   TCP. One endpoint, eventfd-backed completion channel. Lets the server
//!   run on any Linux box.
//!
//! - `MockFabric` (testing): scripted events and completions, journals
//!   every call so tests can assert on ordering.
//!
//! **Threading contract:** posting (main thread) and polling (poller
//! thread) may run concurrently on the same queue pair and completion
//! queue. Implementations are internally synchronized; callers add no
//! locking of their own.

use std::net::SocketAddr;

use crate::completion::WorkCompletion;
use crate::error::Result;
use crate::event::{CmEvent, PendingEvent};
use crate::handle::{ChannelHandle, CmId, CqHandle, EndpointId, PdHandle, QpHandle};
use crate::work_request::{MemoryRegion, QpInitAttr, RawRegion, RecvWr, SendWr};

/// Connection-management channel.
pub trait CmProvider: Send + Sync {
    /// Bind the listening identity and start listening.
    ///
    /// Port 0 asks the system for a port. Returns the bound address.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr>;

    /// Block until the next event arrives.
    ///
    /// Returns `Ok(None)` once `shutdown_events` has been called.
    fn get_event(&self) -> Result<Option<PendingEvent>>;

    /// Hand a pending event back to the channel. Exactly once per event.
    fn ack_event(&self, event: PendingEvent) -> Result<()>;

    /// Get the next event as an owned value.
    ///
    /// Copies the event, acknowledges the original, returns the copy. A
    /// slow handler therefore never holds an event hostage in the channel.
    fn receive_next_event(&self) -> Result<Option<CmEvent>> {
        let pending = match self.get_event()? {
            Some(pending) => pending,
            None => return Ok(None),
        };
        let event = *pending.event();
        self.ack_event(pending)?;
        Ok(Some(event))
    }

    /// Accept a connection request. No private data, no special parameters.
    fn accept(&self, id: CmId) -> Result<()>;

    /// Release a transport identity.
    fn destroy_id(&self, id: CmId) -> Result<()>;

    /// Wake a blocked `get_event`; every later call returns `Ok(None)`.
    fn shutdown_events(&self);
}

/// Verbs: protection domains, completion queues, queue pairs, memory.
pub trait VerbsProvider: Send + Sync {
    fn alloc_pd(&self, endpoint: EndpointId) -> Result<PdHandle>;

    fn create_comp_channel(&self, endpoint: EndpointId) -> Result<ChannelHandle>;

    /// Create a completion queue with room for at least `depth` entries,
    /// reporting to `channel`.
    fn create_cq(&self, endpoint: EndpointId, depth: u32, channel: ChannelHandle)
        -> Result<CqHandle>;

    /// Arm a one-shot notification: the next completion added to `cq`
    /// fires one event on its channel.
    fn req_notify_cq(&self, cq: CqHandle) -> Result<()>;

    /// Block until the channel fires. Returns the queue that fired, or
    /// `Ok(None)` once `interrupt_channel` has been called.
    fn get_cq_event(&self, channel: ChannelHandle) -> Result<Option<CqHandle>>;

    /// Acknowledge `n` events previously returned by `get_cq_event`.
    fn ack_cq_events(&self, cq: CqHandle, n: u32);

    /// Drain ready completions into `out` (non-blocking, FIFO).
    ///
    /// Returns the number written; 0 when the queue is empty.
    fn poll_cq(&self, cq: CqHandle, out: &mut [WorkCompletion]) -> Result<usize>;

    /// Wake a blocked `get_cq_event`; every later call returns `Ok(None)`.
    fn interrupt_channel(&self, channel: ChannelHandle);

    /// Create the queue pair of a connection identity.
    fn create_qp(&self, id: CmId, pd: PdHandle, attr: &QpInitAttr) -> Result<QpHandle>;

    /// Destroy the queue pair of a connection identity.
    ///
    /// After this returns the provider never touches memory referenced by
    /// work requests posted on that queue pair.
    fn destroy_qp(&self, id: CmId) -> Result<()>;

    /// Register memory against a protection domain.
    ///
    /// # Safety
    ///
    /// `region` must stay valid for reads and writes until the region is
    /// deregistered and every queue pair that had work posted against it is
    /// destroyed. The provider writes into it from its own threads.
    unsafe fn reg_mr(&self, pd: PdHandle, region: RawRegion, access: u32) -> Result<MemoryRegion>;

    fn dereg_mr(&self, mr: MemoryRegion) -> Result<()>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> Result<()>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> Result<()>;
}

/// A complete fabric: both halves, shareable across the two loops.
pub trait Fabric: CmProvider + VerbsProvider + 'static {}

impl<T> Fabric for T where T: CmProvider + VerbsProvider + 'static {}
