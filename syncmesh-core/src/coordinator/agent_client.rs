//! Outbound task pushes to agents

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::protocol::{RpcReply, UpdateTasksRequest, AGENT_TASKS_PATH};
use crate::registry::Endpoint;
use crate::task::Task;

/// Task-update call the master makes on each agent
#[async_trait::async_trait]
pub trait AgentRpc: Send + Sync {
    async fn update_tasks(
        &self,
        endpoint: &Endpoint,
        tasks: Vec<Task>,
        fencing_token: u64,
    ) -> Result<RpcReply>;
}

/// Configuration for the HTTP agent client
#[derive(Debug, Clone)]
pub struct AgentClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for AgentClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// JSON-over-HTTP agent client
pub struct HttpAgentClient {
    client: Client,
}

impl HttpAgentClient {
    pub fn new(config: AgentClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SyncError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AgentRpc for HttpAgentClient {
    async fn update_tasks(
        &self,
        endpoint: &Endpoint,
        tasks: Vec<Task>,
        fencing_token: u64,
    ) -> Result<RpcReply> {
        let url = format!("http://{}{}", endpoint.address, AGENT_TASKS_PATH);
        let count = tasks.len();
        let request = UpdateTasksRequest {
            tasks,
            fencing_token,
            sent_at: Utc::now(),
        };

        let rpc_err = |reason: String| SyncError::Rpc {
            endpoint: endpoint.address.clone(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| rpc_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rpc_err(format!("HTTP {}", status)));
        }

        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| rpc_err(format!("undecodable reply: {}", e)))?;

        debug!(
            "Pushed {} tasks to {} ({}): code={}",
            count, endpoint.service_id, endpoint.address, reply.code
        );
        Ok(reply)
    }
}
