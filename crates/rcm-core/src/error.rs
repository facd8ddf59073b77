//! RCM error types.
//!
//! Every error is fatal to the process. `ErrorKind` only tells a resource
//! call that failed apart from a protocol-state violation.

use thiserror::Error;

use crate::completion::{WcOpcode, WcStatus};
use crate::handle::{CmId, ConnId, CqHandle, EndpointId};

#[derive(Debug, Error)]
pub enum FabricError {
    /// A fabric call returned failure.
    #[error("{call} failed: {reason}")]
    Call { call: &'static str, reason: String },

    /// A fabric call failed with an OS error.
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Completion queue overflowed its fixed depth.
    #[error("{0} overrun")]
    CqOverrun(CqHandle),

    /// Connection-management event of a kind nobody handles.
    #[error("on_event: unknown event {0}")]
    UnknownEvent(u32),

    /// A completion finished with a non-success status.
    #[error("on_completion: {opcode} for {conn} completed with {status}")]
    CompletionStatus {
        conn: ConnId,
        opcode: WcOpcode,
        status: WcStatus,
    },

    /// A second endpoint showed up after the context was bound.
    #[error("cannot handle events in more than one context (bound to {bound}, got {requested})")]
    EndpointMismatch {
        bound: EndpointId,
        requested: EndpointId,
    },

    /// Event for an identity that has no connection.
    #[error("no connection for {0}")]
    UnknownConnection(CmId),
}

/// Coarse classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceCall,
    ProtocolViolation,
}

impl FabricError {
    pub fn call(call: &'static str, reason: impl Into<String>) -> Self {
        Self::Call { call, reason: reason.into() }
    }

    pub fn os(call: &'static str, source: std::io::Error) -> Self {
        Self::Os { call, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Call { .. } | Self::Os { .. } | Self::CqOverrun(_) => ErrorKind::ResourceCall,
            Self::UnknownEvent(_)
            | Self::CompletionStatus { .. }
            | Self::EndpointMismatch { .. }
            | Self::UnknownConnection(_) => ErrorKind::ProtocolViolation,
        }
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
