//! Agent-side handler for task list pushes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use super::pool::WorkerPool;
use crate::protocol::{RpcReply, UpdateTasksRequest, CODE_BAD_REQUEST};

/// Applies `UpdateTasksRequest`s from the master to the local pool
pub struct TaskUpdateService {
    pool: Arc<WorkerPool>,
    last_fencing_token: AtomicU64,
}

impl TaskUpdateService {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            last_fencing_token: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Fencing token carried by the most recent accepted push
    pub fn last_fencing_token(&self) -> u64 {
        self.last_fencing_token.load(Ordering::Relaxed)
    }

    pub async fn update_tasks(&self, request: UpdateTasksRequest) -> RpcReply {
        if let Some(err) = request.tasks.iter().find_map(|t| t.validate().err()) {
            warn!("Rejecting task push: {}", err);
            return RpcReply::error(CODE_BAD_REQUEST, err.to_string());
        }

        info!(
            "Received {} tasks (fencing token {}, sent at {})",
            request.tasks.len(),
            request.fencing_token,
            request.sent_at
        );
        self.last_fencing_token
            .store(request.fencing_token, Ordering::Relaxed);
        self.pool.update_tasks(request.tasks).await;
        RpcReply::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::task::{Task, TaskPayload};
    use crate::worker::pool::{SyncExecutor, WorkerPoolConfig};
    use std::time::Duration;

    struct Noop;

    #[async_trait::async_trait]
    impl SyncExecutor for Noop {
        async fn execute_sync(&self, _payload: &TaskPayload) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_invalid_task_is_rejected() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::default(), Arc::new(Noop)));
        let service = TaskUpdateService::new(pool.clone());

        let mut bad = Task::new(TaskPayload::SyncIdl { idl_id: 1 }, Duration::from_secs(10));
        bad.id.clear();
        let reply = service
            .update_tasks(UpdateTasksRequest {
                tasks: vec![bad],
                fencing_token: 4,
                sent_at: chrono::Utc::now(),
            })
            .await;

        assert_eq!(reply.code, CODE_BAD_REQUEST);
        assert!(pool.tasks().is_empty());
        assert_eq!(service.last_fencing_token(), 0);

        let good = Task::new(TaskPayload::SyncRepo { repo_id: 2 }, Duration::from_secs(10));
        let reply = service
            .update_tasks(UpdateTasksRequest {
                tasks: vec![good],
                fencing_token: 5,
                sent_at: chrono::Utc::now(),
            })
            .await;
        assert!(reply.is_ok());
        assert_eq!(pool.tasks().len(), 1);
        assert_eq!(service.last_fencing_token(), 5);
        pool.stop().await;
    }
}
