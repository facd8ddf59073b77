//! Progress reporting.
//!
//! The executor reports what happened; where the lines go (stdout, a test
//! recorder) is up to the sink.

use crate::handle::ConnId;

use core::fmt;

/// One reportable step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<'a> {
    Listening { port: u16 },
    ConnectRequest,
    /// Established; the outbound message is about to be posted.
    Connected(ConnId),
    /// Inbound message, already bounded to the receive buffer.
    Received { conn: ConnId, message: &'a [u8] },
    SendCompleted(ConnId),
    Disconnected(ConnId),
}

/// The human-readable progress line.
impl fmt::Display for Progress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { port } => write!(f, "listening on port {}.", port),
            Self::ConnectRequest => write!(f, "received connection request."),
            Self::Connected(_) => write!(f, "connected. posting send..."),
            Self::Received { message, .. } => {
                write!(f, "received message: {}", String::from_utf8_lossy(message))
            }
            Self::SendCompleted(_) => write!(f, "send completed successfully."),
            Self::Disconnected(_) => write!(f, "peer disconnected."),
        }
    }
}

/// Receives progress reports from both loops.
///
/// **Contract:** called from the main thread and the poller thread.
/// Must not block for long: the poller is inside a drain cycle.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress<'_>);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _progress: Progress<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lines() {
        assert_eq!(Progress::Listening { port: 7471 }.to_string(), "listening on port 7471.");
        assert_eq!(Progress::Connected(ConnId(1)).to_string(), "connected. posting send...");
        let received = Progress::Received {
            conn: ConnId(1),
            message: b"hello",
        };
        assert_eq!(received.to_string(), "received message: hello");
        assert_eq!(Progress::Disconnected(ConnId(1)).to_string(), "peer disconnected.");
    }
}
