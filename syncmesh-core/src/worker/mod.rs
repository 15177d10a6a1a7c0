//! Agent-side logic
//!
//! Registry client, the bounded worker pool, and the handler that installs
//! task lists pushed by the master.

pub mod client;
pub mod pool;
pub mod service;

pub use client::{RegistryClient, RegistryClientConfig};
pub use pool::{PoolSnapshot, SyncExecutor, WorkerPool, WorkerPoolConfig, MAX_WORKERS};
pub use service::TaskUpdateService;
