//! Process configuration
//!
//! Every component owns a config struct with sensible defaults. The binaries
//! build a [`SyncmeshConfig`] from `SYNCMESH_*` environment variables and
//! hand the parts to the components they start.

use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::{AgentClientConfig, ManagerConfig};
use crate::error::{Result, SyncError};
use crate::registry::RegistryConfig;
use crate::store::StoreConfig;
use crate::worker::{RegistryClientConfig, WorkerPoolConfig};

/// API replica settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub manager: ManagerConfig,
    pub agent_client: AgentClientConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:11010".into(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            manager: ManagerConfig::default(),
            agent_client: AgentClientConfig::default(),
        }
    }
}

/// Agent settings
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: String,
    pub pool: WorkerPoolConfig,
    pub registry_client: RegistryClientConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:11011".into(),
            pool: WorkerPoolConfig::default(),
            registry_client: RegistryClientConfig::default(),
        }
    }
}

/// Configuration of both binaries
#[derive(Debug, Clone, Default)]
pub struct SyncmeshConfig {
    pub api: ApiConfig,
    pub agent: AgentConfig,
}

impl SyncmeshConfig {
    /// Defaults overridden by `SYNCMESH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        let api = &mut config.api;
        api.bind_addr = env_or("SYNCMESH_API_BIND", api.bind_addr.clone())?;
        api.store.url = env_or("SYNCMESH_STORE_URL", api.store.url.clone())?;
        api.registry.ttl = env_duration("SYNCMESH_REGISTRY_TTL", api.registry.ttl)?;
        api.registry.sync_interval =
            env_duration("SYNCMESH_REGISTRY_SYNC_INTERVAL", api.registry.sync_interval)?;

        let manager = &mut api.manager;
        manager.replica_id = env_or("SYNCMESH_REPLICA_ID", manager.replica_id.clone())?;
        manager.sync_idl_interval =
            env_duration("SYNCMESH_SYNC_IDL_INTERVAL", manager.sync_idl_interval)?;
        manager.sync_repo_interval =
            env_duration("SYNCMESH_SYNC_REPO_INTERVAL", manager.sync_repo_interval)?;
        manager.sync_agent_interval =
            env_duration("SYNCMESH_SYNC_AGENT_INTERVAL", manager.sync_agent_interval)?;
        manager.reconcile_interval =
            env_duration("SYNCMESH_RECONCILE_INTERVAL", manager.reconcile_interval)?;
        manager.update_task_interval =
            env_duration("SYNCMESH_UPDATE_TASK_INTERVAL", manager.update_task_interval)?;
        manager.election.lease_ttl =
            env_duration("SYNCMESH_LEASE_TTL", manager.election.lease_ttl)?;

        let agent = &mut config.agent;
        agent.bind_addr = env_or("SYNCMESH_AGENT_BIND", agent.bind_addr.clone())?;
        agent.pool.workers = env_or("SYNCMESH_WORKER_NUM", agent.pool.workers)?;
        agent.pool.min_round_interval =
            env_duration("SYNCMESH_MIN_SYNC_TIME", agent.pool.min_round_interval)?;

        let client = &mut agent.registry_client;
        client.api_addr = env_or("SYNCMESH_API_ADDR", client.api_addr.clone())?;
        client.service_id = env_or("SYNCMESH_SERVICE_ID", client.service_id.clone())?;
        client.host = env_or("SYNCMESH_AGENT_HOST", client.host.clone())?;
        client.port = env_or("SYNCMESH_AGENT_PORT", client.port)?;
        client.heartbeat_interval =
            env_duration("SYNCMESH_HEARTBEAT_INTERVAL", client.heartbeat_interval)?;

        Ok(config)
    }
}

/// Parse `"30"`, `"30s"`, `"250ms"`, `"5m"` or `"1h"`
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Duration::ZERO);
    }
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| SyncError::Config {
            message: format!("{name}: cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_duration(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => parse_duration(&raw).ok_or_else(|| SyncError::Config {
            message: format!("{name}: invalid duration {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
