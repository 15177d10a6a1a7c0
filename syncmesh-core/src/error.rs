//! Error types for syncmesh
//!
//! One taxonomy shared by the dispatcher, the coordination manager,
//! the registry and the agent-side worker pool.

use thiserror::Error;

/// Primary error type for all syncmesh operations
#[derive(Debug, Error)]
pub enum SyncError {
    // ========== Lookup Errors ==========

    /// Service (agent instance) is not known
    #[error("Service {service_id} not found")]
    ServiceNotFound { service_id: String },

    /// Task id is not known
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    /// Durable record is not known
    #[error("Record {id} not found")]
    RecordNotFound { id: String },

    // ========== Transient I/O Errors ==========

    /// Shared store operation failed
    #[error("Store operation failed: {message}")]
    Store { message: String },

    /// Outbound call to an agent failed
    #[error("RPC to {endpoint} failed: {reason}")]
    Rpc { endpoint: String, reason: String },

    /// Connection failed
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    // ========== Coordination Errors ==========

    /// Internal state no longer satisfies an invariant
    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    /// Bounded retry gave up
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Control plane stopped answering heartbeats
    #[error("Control plane unreachable after {failures} consecutive failures")]
    ControlPlaneUnreachable { failures: u32 },

    // ========== Protocol Errors ==========

    /// Malformed or unknown message
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// JSON encode/decode failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Runtime Errors ==========

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Sync execution failed on an agent
    #[error("Execution failed: {message}")]
    Execution { message: String },

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Store { .. } | SyncError::Rpc { .. } | SyncError::ConnectionFailed { .. }
        )
    }

    /// Returns true if this error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::ServiceNotFound { .. }
                | SyncError::TaskNotFound { .. }
                | SyncError::RecordNotFound { .. }
        )
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        SyncError::Store {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        SyncError::store(err)
    }
}

/// Result type alias for syncmesh operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = SyncError::Store {
            message: "timeout".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_not_found());

        let err = SyncError::ServiceNotFound {
            service_id: "agent-1".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Service agent-1 not found");
    }
}
