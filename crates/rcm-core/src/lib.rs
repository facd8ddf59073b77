//! # rcm-core — Trait definitions for RCM
//!
//! RCM is the passive side of a reliable, connection-oriented fabric. It
//! consumes two independent event sources: the connection-management
//! channel (requests, establishment, teardown) and the completion channel
//! (finished sends and receives).
//!
//! This crate defines the boundary to the transport as a capability set.
//! It contains no transport code: the soft and mock fabrics live in
//! `rcm-module`, the event loops live in `rcm-executor`.
//!
//! ## Modules
//!
//! - `handle` - Typed handles for fabric objects and connections
//! - `event` - Connection-management events
//! - `completion` - Work completions
//! - `work_request` - Scatter/gather entries, work requests, QP attributes
//! - `fabric` - `CmProvider` / `VerbsProvider` capability traits
//! - `progress` - Progress reporting sink
//! - `cancel` - Cancellation token shared by both loops
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod handle;
pub mod event;
pub mod completion;
pub mod work_request;
pub mod fabric;
pub mod progress;
pub mod cancel;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use handle::{ChannelHandle, CmId, ConnId, CqHandle, EndpointId, PdHandle, QpHandle};
pub use event::{CmEvent, CmEventKind, PendingEvent};
pub use completion::{WcOpcode, WcStatus, WorkCompletion};
pub use work_request::{access, MemoryRegion, QpCaps, QpInitAttr, RawRegion, RecvWr, SendWr, Sge};
pub use fabric::{CmProvider, Fabric, VerbsProvider};
pub use progress::{NullSink, Progress, ProgressSink};
pub use cancel::CancellationToken;
pub use error::{ErrorKind, FabricError, Result};
pub use env::env_get;
