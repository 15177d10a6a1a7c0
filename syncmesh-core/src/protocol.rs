//! HTTP wire types shared by the API and agent binaries

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskType};

/// Agent endpoint receiving its full task list
pub const AGENT_TASKS_PATH: &str = "/agent/tasks";

pub const REGISTER_PATH: &str = "/api/registry/register";
pub const UPDATE_PATH: &str = "/api/registry/update";
pub const DEREGISTER_PATH: &str = "/api/registry/deregister";
pub const PING_PATH: &str = "/api/ping";
/// `GET` lists assignments, `POST` adds a task
pub const TASKS_PATH: &str = "/api/tasks";
pub const TASKS_DELETE_PATH: &str = "/api/tasks/delete";
pub const METRICS_PATH: &str = "/metrics";

/// Reply code for success
pub const CODE_OK: i32 = 0;
pub const CODE_BAD_REQUEST: i32 = 400;
pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_INTERNAL: i32 = 500;

/// Generic `{code, msg}` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReply {
    pub code: i32,
    pub msg: String,
}

impl RpcReply {
    pub fn ok() -> Self {
        Self {
            code: CODE_OK,
            msg: "ok".into(),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }
}

/// Full replacement of an agent's task list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTasksRequest {
    pub tasks: Vec<Task>,
    /// Fencing token of the pushing master
    pub fencing_token: u64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub service_id: String,
    pub host: String,
    pub port: u16,
}

/// Heartbeat and deregistration both identify the agent only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub service_id: String,
}

/// Add or delete the sync task of one record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub id: i64,
}

/// Dispatcher view of one API replica
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentsView {
    pub replica_id: String,
    pub master: bool,
    pub unassigned: usize,
    pub assignments: HashMap<String, Vec<Task>>,
}
