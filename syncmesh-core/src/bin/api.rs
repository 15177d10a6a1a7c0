//! API replica binary

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncmesh_core::coordinator::{CoordinationManager, HttpAgentClient};
use syncmesh_core::http::{self, api_router, ApiState};
use syncmesh_core::registry::Registry;
use syncmesh_core::runtime::ShutdownSignal;
use syncmesh_core::source::StoreTaskSource;
use syncmesh_core::{store, SyncmeshConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("syncmesh_core=info,syncmesh_api=info,warn")),
        )
        .init();

    let config = SyncmeshConfig::from_env()?.api;
    info!("Starting Syncmesh API replica {}", config.manager.replica_id);

    info!("Connecting to store at {}", config.store.url);
    let store = store::connect(&config.store).await?;

    let shutdown = ShutdownSignal::new();
    let registry = Arc::new(Registry::new(store.clone(), config.registry.clone()));
    let registry_sync = registry.start_sync(shutdown.clone());

    let agents = Arc::new(HttpAgentClient::new(config.agent_client.clone())?);
    let source = Arc::new(StoreTaskSource::new(store.clone()));
    let manager = Arc::new(CoordinationManager::new(
        config.manager.clone(),
        store,
        registry.clone(),
        source,
        agents,
    )?);
    manager.start().await?;

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let router = api_router(ApiState {
        registry,
        manager: manager.clone(),
    });
    let server = tokio::spawn(http::serve(listener, router, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.shutdown();
    manager.stop().await;
    registry_sync.await?;
    server.await??;
    Ok(())
}
