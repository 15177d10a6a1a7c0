//! Endpoint resolution over the registry

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::service::{Registry, RegistryEntry};

/// Tag carrying the agent's service id on every endpoint
pub const SERVICE_ID_TAG: &str = "service_id";

const DEFAULT_WEIGHT: u32 = 10;

/// Address of one agent instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub service_id: String,
    /// `host:port`
    pub address: String,
    pub weight: u32,
    pub tags: HashMap<String, String>,
}

impl From<&RegistryEntry> for Endpoint {
    fn from(entry: &RegistryEntry) -> Self {
        Self {
            service_id: entry.service_id.clone(),
            address: entry.address(),
            weight: DEFAULT_WEIGHT,
            tags: HashMap::from([(SERVICE_ID_TAG.to_string(), entry.service_id.clone())]),
        }
    }
}

/// Result of one resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Liveness changes constantly, so callers must not cache the list
    pub cacheable: bool,
    pub endpoints: Vec<Endpoint>,
}

/// Turns registry state into endpoint lists for load balancing
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<Registry>,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn name(&self) -> &'static str {
        "syncmesh-registry"
    }

    /// Every unexpired agent
    pub fn resolve(&self) -> Resolution {
        Resolution {
            cacheable: false,
            endpoints: self.registry.list().iter().map(Endpoint::from).collect(),
        }
    }

    /// Endpoint of a single agent
    pub fn resolve_service(&self, service_id: &str) -> Option<Endpoint> {
        self.registry.get(service_id).as_ref().map(Endpoint::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_resolve_tags_endpoints() {
        let registry = Arc::new(Registry::new(
            Arc::new(MemoryStore::new()),
            RegistryConfig::default(),
        ));
        registry.register("agent-1", "10.0.0.1", 7000).await.unwrap();
        registry.register("agent-2", "10.0.0.2", 7000).await.unwrap();

        let resolver = Resolver::new(registry);
        let resolution = resolver.resolve();
        assert!(!resolution.cacheable);
        assert_eq!(resolution.endpoints.len(), 2);
        assert_eq!(resolution.endpoints[0].tags[SERVICE_ID_TAG], "agent-1");

        let endpoint = resolver.resolve_service("agent-2").unwrap();
        assert_eq!(endpoint.address, "10.0.0.2:7000");
        assert!(resolver.resolve_service("agent-3").is_none());
    }
}
