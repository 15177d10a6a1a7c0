//! Sync task model
//!
//! A [`Task`] is the unit of scheduled work the API replicas hand to agents.
//! Its payload is a tagged union keyed by [`TaskType`]; the business key of a
//! payload ([`TaskKey`]) is what callers use to remove a task without knowing
//! its generated id.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Kind of sync work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Re-fetch an IDL from its repository
    SyncIdl,
    /// Re-fetch repository metadata
    SyncRepo,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::SyncIdl => f.write_str("sync_idl"),
            TaskType::SyncRepo => f.write_str("sync_repo"),
        }
    }
}

/// Type-specific task data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TaskPayload {
    SyncIdl { idl_id: i64 },
    SyncRepo { repo_id: i64 },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::SyncIdl { .. } => TaskType::SyncIdl,
            TaskPayload::SyncRepo { .. } => TaskType::SyncRepo,
        }
    }

    /// Business key used by the secondary index
    pub fn key(&self) -> TaskKey {
        match *self {
            TaskPayload::SyncIdl { idl_id } => TaskKey::new(TaskType::SyncIdl, idl_id),
            TaskPayload::SyncRepo { repo_id } => TaskKey::new(TaskType::SyncRepo, repo_id),
        }
    }
}

impl From<TaskKey> for TaskPayload {
    fn from(key: TaskKey) -> Self {
        match key.task_type {
            TaskType::SyncIdl => TaskPayload::SyncIdl { idl_id: key.id },
            TaskType::SyncRepo => TaskPayload::SyncRepo { repo_id: key.id },
        }
    }
}

/// Payload business key: task type plus the id of the synced record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub task_type: TaskType,
    pub id: i64,
}

impl TaskKey {
    pub fn new(task_type: TaskType, id: i64) -> Self {
        Self { task_type, id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.task_type, self.id)
    }
}

/// A unit of scheduled sync work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task id
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Interval between two executions
    #[serde(with = "schedule_time")]
    pub schedule_time: Duration,
    pub payload: TaskPayload,
}

impl Task {
    /// Create a task with a fresh random id
    pub fn new(payload: TaskPayload, schedule_time: Duration) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload, schedule_time)
    }

    pub fn with_id(id: impl Into<String>, payload: TaskPayload, schedule_time: Duration) -> Self {
        Self {
            id: id.into(),
            task_type: payload.task_type(),
            schedule_time,
            payload,
        }
    }

    pub fn key(&self) -> TaskKey {
        self.payload.key()
    }

    /// Reject tasks whose declared type disagrees with the payload variant
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SyncError::InvalidMessage {
                reason: "task id is empty".into(),
            });
        }
        if self.task_type != self.payload.task_type() {
            return Err(SyncError::InvalidMessage {
                reason: format!(
                    "task {} declares type {} but carries a {} payload",
                    self.id,
                    self.task_type,
                    self.payload.task_type()
                ),
            });
        }
        Ok(())
    }
}

/// Propagation command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskCommand {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "del")]
    Delete,
}

/// Cross-replica propagation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub command: TaskCommand,
    pub task: Task,
}

impl TaskMessage {
    pub fn add(task: Task) -> Self {
        Self {
            command: TaskCommand::Add,
            task,
        }
    }

    pub fn delete(task: Task) -> Self {
        Self {
            command: TaskCommand::Delete,
            task,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a message received from the channel
    pub fn decode(raw: &str) -> Result<Self> {
        let msg: TaskMessage = serde_json::from_str(raw).map_err(|e| SyncError::InvalidMessage {
            reason: e.to_string(),
        })?;
        msg.task.validate()?;
        Ok(msg)
    }
}

/// `scheduleTime` travels as a duration string such as `"30s"`, `"5m"` or `"1h"`.
mod schedule_time {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid schedule time {raw:?}")))
    }

    pub(super) fn parse(raw: &str) -> Option<Duration> {
        crate::config::parse_duration(raw)
    }
}
