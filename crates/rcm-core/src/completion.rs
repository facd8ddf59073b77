//! Work completions.
//!
//! One `WorkCompletion` is produced per finished signaled work request and
//! consumed immediately by the completion handler. Never persisted.

use crate::handle::ConnId;

use core::fmt;

/// What finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

impl fmt::Display for WcOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "SEND"),
            Self::Recv => write!(f, "RECV"),
        }
    }
}

/// Completion status. Anything but `Success` is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Inbound message larger than the posted receive.
    LocalLength,
    /// Work request referenced memory outside its region.
    LocalProtection,
    /// Flushed because the queue pair went to error state.
    WrFlush,
    /// Transport retries exhausted (peer unreachable).
    RetryExceeded,
    RemoteAccess,
    General,
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::LocalLength => "local length error",
            Self::LocalProtection => "local protection error",
            Self::WrFlush => "work request flushed error",
            Self::RetryExceeded => "transport retry counter exceeded",
            Self::RemoteAccess => "remote access error",
            Self::General => "general error",
        };
        f.write_str(s)
    }
}

/// A drained completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// The `wr_id` the work request was posted with.
    pub wr_id: ConnId,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes placed into the receive buffer (receives only).
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Filler for preallocated drain buffers.
    pub const EMPTY: Self = Self {
        wr_id: ConnId::NONE,
        status: WcStatus::General,
        opcode: WcOpcode::Send,
        byte_len: 0,
    };

    pub fn success(wr_id: ConnId, opcode: WcOpcode, byte_len: u32) -> Self {
        Self { wr_id, status: WcStatus::Success, opcode, byte_len }
    }

    pub fn failed(wr_id: ConnId, opcode: WcOpcode, status: WcStatus) -> Self {
        Self { wr_id, status, opcode, byte_len: 0 }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}
