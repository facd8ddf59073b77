//! # rcm-module — Fabric implementations
//!
//! This crate provides the implementations behind the `rcm-core` traits.
//!
//! ## Default stack
//!
//! | Concern              | Impl          | Alternative                  |
//! |----------------------|---------------|------------------------------|
//! | CmProvider + Verbs   | SoftFabric    | MockFabric (tests)           |
//! | Completion queue     | SoftCq        | (hardware CQ)                |
//! | Completion channel   | SoftChannel   | (ibv_comp_channel)           |
//! | Registered memory    | HeapRegion    | (hugepage regions, future)   |
//!
//! `SoftFabric` speaks a small framed protocol over TCP (`wire`), so the
//! server runs anywhere. `SoftPeer` is the matching active side used by
//! the smoke binary and tests.

pub mod heap_region;
pub mod wire;
pub mod soft_cq;
pub mod soft_fabric;
pub mod soft_peer;
pub mod mock;

pub use heap_region::HeapRegion;
pub use mock::{Call, MockFabric};
pub use soft_fabric::SoftFabric;
pub use soft_peer::SoftPeer;
