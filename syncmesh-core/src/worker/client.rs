//! Registry client for agents
//!
//! Registers the agent with an API replica and keeps its record alive with
//! periodic heartbeats. Consecutive failures back off linearly; after too
//! many in a row the control plane is treated as unreachable and the loop
//! returns an error so the agent can exit.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::metrics::standard;
use crate::protocol::{
    RegisterRequest, RpcReply, ServiceRequest, CODE_NOT_FOUND, CODE_OK, DEREGISTER_PATH,
    REGISTER_PATH, UPDATE_PATH,
};
use crate::runtime::{Backoff, ShutdownSignal};

/// Configuration for the registry client
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// Base URL of an API replica, e.g. `http://127.0.0.1:11010`
    pub api_addr: String,
    pub service_id: String,
    /// Address advertised to the master for task pushes
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Delay after consecutive heartbeat failures
    pub retry_backoff: Backoff,
    pub max_consecutive_failures: u32,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            api_addr: "http://127.0.0.1:11010".into(),
            service_id: uuid::Uuid::new_v4().to_string(),
            host: "127.0.0.1".into(),
            port: 11011,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            retry_backoff: Backoff::Linear {
                base: Duration::from_secs(3),
                max: Duration::from_secs(30),
            },
            max_consecutive_failures: 6,
        }
    }
}

/// Agent-side registry client
pub struct RegistryClient {
    config: RegistryClientConfig,
    http: Client,
    shutdown: ShutdownSignal,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SyncError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            config,
            http,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }

    pub async fn register(&self) -> Result<()> {
        info!(
            "Registering {} at {}:{} with {}",
            self.config.service_id, self.config.host, self.config.port, self.config.api_addr
        );
        let request = RegisterRequest {
            service_id: self.config.service_id.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
        };
        self.call(REGISTER_PATH, &request).await
    }

    /// Refresh the registry record. A replica that does not know this agent
    /// (it restarted, or the record expired) gets a fresh registration.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.call(UPDATE_PATH, &self.service_request()).await {
            Err(SyncError::ServiceNotFound { .. }) => {
                warn!(
                    "Registry lost {}, registering again",
                    self.config.service_id
                );
                self.register().await
            }
            other => other,
        }
    }

    /// Stop heartbeating and remove the registry record
    pub async fn deregister(&self) -> Result<()> {
        self.shutdown.shutdown();
        info!("Deregistering {}", self.config.service_id);
        self.call(DEREGISTER_PATH, &self.service_request()).await
    }

    /// Heartbeat until deregistered or the control plane is unreachable
    pub async fn run(&self) -> Result<()> {
        let mut failures: u32 = 0;
        let mut delay = self.config.heartbeat_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }

            match self.heartbeat().await {
                Ok(()) => {
                    if failures > 0 {
                        info!("Heartbeat recovered after {} failures", failures);
                    }
                    failures = 0;
                    delay = self.config.heartbeat_interval;
                    debug!("Heartbeat sent for {}", self.config.service_id);
                }
                Err(e) => {
                    failures += 1;
                    standard::HEARTBEAT_FAILURES.inc();
                    if failures >= self.config.max_consecutive_failures {
                        return Err(SyncError::ControlPlaneUnreachable { failures });
                    }
                    delay = self.config.retry_backoff.delay(failures);
                    warn!(
                        "Heartbeat failed ({}/{}), retrying in {:?}: {}",
                        failures, self.config.max_consecutive_failures, delay, e
                    );
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) in the background
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    fn service_request(&self) -> ServiceRequest {
        ServiceRequest {
            service_id: self.config.service_id.clone(),
        }
    }

    async fn call<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.config.api_addr.trim_end_matches('/'), path);
        let conn_err = |reason: String| SyncError::ConnectionFailed {
            endpoint: url.clone(),
            reason,
        };

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| conn_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(conn_err(format!("HTTP {}", status)));
        }

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| conn_err(format!("undecodable reply: {}", e)))?;

        match reply.code {
            CODE_OK => Ok(()),
            CODE_NOT_FOUND => Err(SyncError::ServiceNotFound {
                service_id: self.config.service_id.clone(),
            }),
            _ => Err(SyncError::Rpc {
                endpoint: url.clone(),
                reason: format!("code {}: {}", reply.code, reply.msg),
            }),
        }
    }
}
