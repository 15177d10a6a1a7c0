//! Unit tests for the service registry and resolver

use std::sync::Arc;
use std::time::Duration;

use syncmesh_core::registry::{service_key, Registry, RegistryConfig, Resolver, SERVICE_ID_TAG};
use syncmesh_core::store::{MemoryStore, SharedStore};
use syncmesh_core::SyncError;

fn registry(store: Arc<dyn SharedStore>) -> Arc<Registry> {
    Arc::new(Registry::new(
        store,
        RegistryConfig {
            ttl: Duration::from_secs(60),
            sync_interval: Duration::from_secs(3),
        },
    ))
}

fn addresses(resolver: &Resolver) -> Vec<String> {
    resolver
        .resolve()
        .endpoints
        .into_iter()
        .map(|e| e.address)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_resolve_drops_entries_after_ttl() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry(store);
    let resolver = Resolver::new(registry.clone());

    registry.register("svc-1", "10.0.0.1", 9000).await.unwrap();

    let resolution = resolver.resolve();
    assert!(!resolution.cacheable);
    assert_eq!(addresses(&resolver), vec!["10.0.0.1:9000".to_string()]);
    assert_eq!(
        resolution.endpoints[0].tags.get(SERVICE_ID_TAG).map(String::as_str),
        Some("svc-1")
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(addresses(&resolver).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_extends_lifetime() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry(store.clone());

    registry.register("svc-1", "10.0.0.1", 9000).await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;
    registry.update("svc-1").await.unwrap();
    tokio::time::advance(Duration::from_secs(40)).await;

    assert!(registry.get("svc-1").is_some());
    assert!(store.get(&service_key("svc-1")).await.unwrap().is_some());

    let err = registry.update("svc-unknown").await.unwrap_err();
    assert!(matches!(err, SyncError::ServiceNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_update_rewrites_expired_store_key() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry(store.clone());

    registry.register("svc-1", "10.0.0.1", 9000).await.unwrap();
    store.del(&service_key("svc-1")).await.unwrap();

    registry.update("svc-1").await.unwrap();
    assert_eq!(
        store.get(&service_key("svc-1")).await.unwrap().as_deref(),
        Some("10.0.0.1:9000")
    );
}

#[tokio::test(start_paused = true)]
async fn test_sync_backfills_peer_registrations() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let local = registry(store.clone());
    let peer = registry(store.clone());

    peer.register("svc-1", "10.0.0.1", 9000).await.unwrap();
    peer.register("svc-2", "10.0.0.2", 9000).await.unwrap();
    store
        .set_ex(&service_key("svc-bad"), "no-port", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(local.sync_once().await.unwrap(), 2);
    assert_eq!(local.service_ids(), vec!["svc-1", "svc-2"]);
    assert_eq!(local.sync_once().await.unwrap(), 0);

    // Backfilled entries keep the store's remaining lifetime
    tokio::time::advance(Duration::from_secs(61)).await;
    local.sync_once().await.unwrap();
    assert_eq!(local.count(), 0);
}

#[tokio::test]
async fn test_deregister_removes_everywhere() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = registry(store.clone());

    registry.register("svc-1", "10.0.0.1", 9000).await.unwrap();
    registry.deregister("svc-1").await.unwrap();

    assert!(registry.list().is_empty());
    assert_eq!(store.get(&service_key("svc-1")).await.unwrap(), None);
    assert!(Resolver::new(registry).resolve_service("svc-1").is_none());
}

#[tokio::test]
async fn test_register_rejects_empty_id() {
    let registry = registry(Arc::new(MemoryStore::new()));
    let err = registry.register("", "10.0.0.1", 9000).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidMessage { .. }));
}

#[tokio::test]
async fn test_sync_drops_services_deregistered_elsewhere() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let local = registry(store.clone());
    let peer = registry(store.clone());

    local.register("svc-1", "10.0.0.1", 9000).await.unwrap();
    local.register("svc-2", "10.0.0.2", 9000).await.unwrap();
    peer.sync_once().await.unwrap();

    peer.deregister("svc-1").await.unwrap();
    assert!(local.get("svc-1").is_some());

    local.sync_once().await.unwrap();
    assert_eq!(local.service_ids(), vec!["svc-2"]);
    assert!(Resolver::new(local).resolve_service("svc-1").is_none());
}
