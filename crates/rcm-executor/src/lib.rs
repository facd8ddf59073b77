//! # rcm-executor — The two event loops
//!
//! ```text
//!  main thread                           rcm-cq-poller
//!  ───────────                           ─────────────
//!  receive_next_event()                  get_cq_event()
//!    CONNECT_REQUEST → ensure context ──spawns──▶ ack, re-arm
//!                      QP, buffers,              drain CQ
//!                      post recv, accept           RECV → read buffer
//!    ESTABLISHED     → post send                   SEND → report
//!    DISCONNECTED    → tear down
//! ```
//!
//! Both loops block on their own channel. They share the connection table
//! (typed `ConnId` lookups) and a `Supervisor`: the first fatal error on
//! either side cancels the shared token and wakes the other loop.
//!
//! Everything is generic over `rcm_core::Fabric`; swap `SoftFabric` for
//! `MockFabric` and nothing here changes.

pub mod config;
pub mod supervisor;
pub mod registrar;
pub mod connection;
pub mod handler;
pub mod poller;
pub mod context;
pub mod lifecycle;
pub mod server;

#[cfg(test)]
mod scenarios;

pub use config::ServerConfig;
pub use connection::{ConnState, Connection, ConnectionTable};
pub use context::{ResourceContext, Resources};
pub use handler::CompletionHandler;
pub use lifecycle::{outbound_message, ConnectionManager};
pub use poller::CompletionPoller;
pub use registrar::{BufferPair, MemoryRegistrar, RegisteredBuffer, RegistrarStats};
pub use server::Server;
pub use supervisor::Supervisor;
