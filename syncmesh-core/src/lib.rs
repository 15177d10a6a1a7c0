//! Syncmesh Core - coordination for scheduled IDL and repository sync
//!
//! This crate provides:
//! - Consistent-hash dispatch of sync tasks across agents
//! - Lease-based master election among API replicas
//! - Cross-replica task propagation and durable-source reconciliation
//! - A store-backed service registry with TTL liveness
//! - The agent-side worker pool that executes pushed tasks

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod source;
pub mod store;
pub mod task;
pub mod worker;

pub use config::SyncmeshConfig;
pub use error::{Result, SyncError};
