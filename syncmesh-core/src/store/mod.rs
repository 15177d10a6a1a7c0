//! Shared store abstraction
//!
//! The store is the only cross-process source of truth: registry entries,
//! the master lease and the task propagation channel all live here.
//! [`RedisStore`] backs production deployments; [`MemoryStore`] serves
//! single-process runs and tests.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// Key prefix for registry entries: `{prefix}{service_id}` -> `host:port`
pub const REGISTRY_SERVICE_PREFIX: &str = "syncmesh:registry:service:";

/// Key holding the master lease
pub const MASTER_LEASE_KEY: &str = "syncmesh:api:master";

/// Key prefix for durable sync records: `{prefix}{task_type}:{id}` -> payload
pub const SOURCE_RECORD_PREFIX: &str = "syncmesh:source:";

/// Channel carrying task add/delete messages between API replicas
pub const TASK_CHANNEL: &str = "syncmesh:task";

/// Store connection settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `redis://host:port/db`, or `memory://` for an in-process store
    pub url: String,
    /// Buffered messages per subscription
    pub subscription_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            subscription_buffer: 256,
        }
    }
}

impl StoreConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Operations the coordination core needs from the shared store
#[async_trait::async_trait]
pub trait SharedStore: Send + Sync {
    /// Set a value without expiry
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set a value with a TTL, overwriting any previous value
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set a value with a TTL only if the key is absent. Returns true when set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Reset the TTL of an existing key. Returns false when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Reset the TTL only while the key still holds `expected`
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Batch read; the result is aligned with `keys`
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    /// Remaining time to live, `None` when the key is missing or has no TTL
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Delete a key. Returns true when it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Delete only while the key still holds `expected`
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// All keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Live subscription to a channel
///
/// Messages are forwarded by a background task that is aborted when the
/// subscription is closed or dropped.
pub struct Subscription {
    channel: String,
    messages: mpsc::Receiver<String>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        channel: &str,
        messages: mpsc::Receiver<String>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            messages,
            forwarder,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, `None` once the underlying stream ended
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Tear down the subscription
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Open the store named by `config.url`
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    if config.url.starts_with("memory://") {
        info!("Using in-process store");
        return Ok(Arc::new(MemoryStore::with_buffer(config.subscription_buffer)));
    }

    info!("Connecting to store at {}", config.url);
    Ok(Arc::new(RedisStore::connect(config).await?))
}
