//! Agent binary

use std::sync::Arc;

use anyhow::Context;
use reqwest::Client;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use syncmesh_core::error::{Result, SyncError};
use syncmesh_core::http::{self, agent_router};
use syncmesh_core::protocol::TaskRequest;
use syncmesh_core::runtime::ShutdownSignal;
use syncmesh_core::task::TaskPayload;
use syncmesh_core::worker::{RegistryClient, SyncExecutor, TaskUpdateService, WorkerPool};
use syncmesh_core::SyncmeshConfig;

/// Forwards each sync to an HTTP hook, or only logs it when no hook is set
struct HookExecutor {
    http: Client,
    hook_url: Option<String>,
}

#[async_trait::async_trait]
impl SyncExecutor for HookExecutor {
    async fn execute_sync(&self, payload: &TaskPayload) -> Result<()> {
        let key = payload.key();
        let Some(url) = &self.hook_url else {
            info!("Sync {}", key);
            return Ok(());
        };

        let request = TaskRequest {
            task_type: key.task_type,
            id: key.id,
        };
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SyncError::Execution {
                message: format!("sync hook for {} failed: {}", key, e),
            })?;
        if !response.status().is_success() {
            return Err(SyncError::Execution {
                message: format!("sync hook for {} returned HTTP {}", key, response.status()),
            });
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("syncmesh_core=info,syncmesh_agent=info,warn")),
        )
        .init();

    let config = SyncmeshConfig::from_env()?.agent;
    info!(
        "Starting Syncmesh agent {}",
        config.registry_client.service_id
    );

    let executor = Arc::new(HookExecutor {
        http: Client::builder()
            .timeout(config.registry_client.request_timeout)
            .build()
            .context("failed to create HTTP client")?,
        hook_url: std::env::var("SYNCMESH_SYNC_HOOK").ok(),
    });
    let pool = Arc::new(WorkerPool::new(config.pool.clone(), executor));
    let service = Arc::new(TaskUpdateService::new(pool.clone()));

    let shutdown = ShutdownSignal::new();
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let server = tokio::spawn(http::serve(listener, agent_router(service), shutdown.clone()));

    let registry = Arc::new(RegistryClient::new(config.registry_client.clone())?);
    registry.register().await?;
    let mut heartbeat = registry.start();

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            Ok(())
        }
        result = &mut heartbeat => match result? {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Lost the control plane: {}", e);
                Err(e)
            }
        },
    };

    if let Err(e) = registry.deregister().await {
        error!("Deregistration failed: {}", e);
    }
    shutdown.shutdown();
    pool.stop().await;
    server.await??;
    outcome?;
    Ok(())
}
