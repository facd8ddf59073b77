//! Connection-management events.
//!
//! A provider hands out a `PendingEvent` which must be acknowledged exactly
//! once. `CmProvider::receive_next_event` does the copy-then-acknowledge
//! step so callers only ever see an owned `CmEvent`.

use crate::handle::{CmId, EndpointId};

use core::fmt;

/// Kind of a connection-management event.
///
/// Anything the provider reports outside the three handled kinds arrives
/// as `Other` with its raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    /// A peer asks to connect. Carries a fresh `CmId`.
    ConnectRequest,
    /// The accepted connection is usable.
    Established,
    /// The peer went away (also after an aborted accept).
    Disconnected,
    /// Any other event code.
    Other(u32),
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRequest => write!(f, "CONNECT_REQUEST"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// An owned, already-acknowledged connection-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    /// Transport identity the event refers to.
    pub id: CmId,
    /// Endpoint the identity is bound to.
    pub endpoint: EndpointId,
}

impl CmEvent {
    pub fn new(kind: CmEventKind, id: CmId, endpoint: EndpointId) -> Self {
        Self { kind, id, endpoint }
    }
}

/// An event still owned by the provider's channel.
///
/// Must go back through `CmProvider::ack_event`.
#[derive(Debug)]
#[must_use = "a pending event must be acknowledged"]
pub struct PendingEvent {
    token: u64,
    event: CmEvent,
}

impl PendingEvent {
    pub fn new(token: u64, event: CmEvent) -> Self {
        Self { token, event }
    }

    /// Provider-private acknowledgement token.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn event(&self) -> &CmEvent {
        &self.event
    }
}
