//! Store-backed service registry
//!
//! Tracks which agent instances are alive. Each replica keeps a local TTL
//! cache that is authoritative for its own reads; the shared store carries
//! the same entries with the same TTL so other replicas can backfill.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::cache::TtlCache;
use crate::error::{Result, SyncError};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::store::{SharedStore, REGISTRY_SERVICE_PREFIX};

/// Configuration for the registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lifetime of an entry without heartbeat
    pub ttl: Duration,
    /// Interval of the store backfill pass
    pub sync_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            sync_interval: Duration::from_secs(3),
        }
    }
}

/// A live agent instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub service_id: String,
    pub host: String,
    pub port: u16,
    pub registered_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(service_id: &str, host: &str, port: u16) -> Self {
        Self {
            service_id: service_id.to_string(),
            host: host.to_string(),
            port,
            registered_at: Utc::now(),
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Store key for a service id
pub fn service_key(service_id: &str) -> String {
    format!("{REGISTRY_SERVICE_PREFIX}{service_id}")
}

/// Split a stored `host:port` value
pub fn parse_address(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

/// Liveness registry of agent instances
pub struct Registry {
    store: Arc<dyn SharedStore>,
    cache: TtlCache<RegistryEntry>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: Arc<dyn SharedStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            cache: TtlCache::new(config.ttl),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register or re-register an agent
    pub async fn register(&self, service_id: &str, host: &str, port: u16) -> Result<()> {
        if service_id.is_empty() {
            return Err(SyncError::InvalidMessage {
                reason: "service id is empty".into(),
            });
        }

        let entry = RegistryEntry::new(service_id, host, port);
        self.store
            .set_ex(&service_key(service_id), &entry.address(), self.config.ttl)
            .await?;
        self.cache.insert(service_id, entry);

        info!("Registered service {} ({}:{})", service_id, host, port);
        Ok(())
    }

    /// Remove an agent from the cache and the store
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        self.cache.remove(service_id);
        self.store.del(&service_key(service_id)).await?;
        info!("Service {} deregistered", service_id);
        Ok(())
    }

    /// Heartbeat: extend the entry's lifetime
    pub async fn update(&self, service_id: &str) -> Result<()> {
        let entry = self
            .cache
            .touch(service_id)
            .ok_or_else(|| SyncError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;

        let key = service_key(service_id);
        if !self.store.expire(&key, self.config.ttl).await? {
            // Key expired in the store while the cache still had it
            self.store
                .set_ex(&key, &entry.address(), self.config.ttl)
                .await?;
            debug!("Rewrote store entry for service {}", service_id);
        }

        debug!("Heartbeat from service {}", service_id);
        Ok(())
    }

    pub fn get(&self, service_id: &str) -> Option<RegistryEntry> {
        self.cache.get(service_id)
    }

    /// Live entries sorted by service id
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> =
            self.cache.entries().into_iter().map(|(_, e)| e).collect();
        entries.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        entries
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.list().into_iter().map(|e| e.service_id).collect()
    }

    pub fn count(&self) -> usize {
        self.cache.len()
    }

    /// One sync pass against the store. Entries this replica has not seen
    /// yet are copied into the cache; cached entries whose store key is gone
    /// (deregistered through another replica) are dropped. Returns the
    /// number of entries added.
    pub async fn sync_once(&self) -> Result<usize> {
        for service_id in self.cache.purge_expired() {
            debug!("Service {} expired from cache", service_id);
        }

        // Registrations write the store before the cache, so an id cached
        // before the scan starts must show up in it
        let cached: Vec<String> = self.cache.entries().into_iter().map(|(id, _)| id).collect();
        let keys = self.store.scan_prefix(REGISTRY_SERVICE_PREFIX).await?;
        let stored: HashSet<&str> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(REGISTRY_SERVICE_PREFIX))
            .collect();

        for service_id in cached.iter().filter(|id| !stored.contains(id.as_str())) {
            if self.cache.remove(service_id).is_some() {
                info!("Service {} left the store, dropping it", service_id);
            }
        }

        let missing: Vec<String> = keys
            .iter()
            .filter(|key| {
                key.strip_prefix(REGISTRY_SERVICE_PREFIX)
                    .is_some_and(|id| !id.is_empty() && !self.cache.contains(id))
            })
            .cloned()
            .collect();

        if missing.is_empty() {
            standard::REGISTERED_AGENTS.set(self.cache.len() as i64);
            return Ok(0);
        }

        let values = self.store.mget(&missing).await?;
        let mut added = 0;
        for (key, value) in missing.iter().zip(values) {
            let service_id = &key[REGISTRY_SERVICE_PREFIX.len()..];
            let Some(raw) = value else {
                // Expired between SCAN and MGET
                continue;
            };
            let Some((host, port)) = parse_address(&raw) else {
                warn!("Skipping service {}: malformed address {:?}", service_id, raw);
                continue;
            };

            let ttl = match self.store.ttl(key).await {
                Ok(Some(remaining)) if !remaining.is_zero() => remaining.min(self.config.ttl),
                Ok(_) => self.config.ttl,
                Err(e) => {
                    warn!("Failed to read TTL of {}: {}", key, e);
                    self.config.ttl
                }
            };
            self.cache
                .insert_with_ttl(service_id, RegistryEntry::new(service_id, &host, port), ttl);
            added += 1;
        }

        if added > 0 {
            info!("Backfilled {} services from store", added);
        }
        standard::REGISTERED_AGENTS.set(self.cache.len() as i64);
        Ok(added)
    }

    /// Run [`Registry::sync_once`] every `sync_interval` until shutdown
    pub fn start_sync(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(registry.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sync_once().await {
                            warn!("Registry sync failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Registry sync loop stopped");
        })
    }
}
