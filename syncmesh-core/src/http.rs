//! HTTP surfaces
//!
//! The API replica serves registry calls, task administration and metrics;
//! the agent serves task pushes and metrics.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::coordinator::CoordinationManager;
use crate::error::{Result, SyncError};
use crate::metrics::gather_system_metrics;
use crate::protocol::{
    AssignmentsView, RegisterRequest, RpcReply, ServiceRequest, TaskRequest, UpdateTasksRequest,
    AGENT_TASKS_PATH, CODE_BAD_REQUEST, CODE_INTERNAL, CODE_NOT_FOUND, DEREGISTER_PATH,
    METRICS_PATH, PING_PATH, REGISTER_PATH, TASKS_DELETE_PATH, TASKS_PATH, UPDATE_PATH,
};
use crate::registry::Registry;
use crate::runtime::ShutdownSignal;
use crate::task::{TaskKey, TaskPayload};
use crate::worker::TaskUpdateService;

/// Shared state of the API router
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub manager: Arc<CoordinationManager>,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route(REGISTER_PATH, post(register))
        .route(UPDATE_PATH, post(heartbeat))
        .route(DEREGISTER_PATH, post(deregister))
        .route(PING_PATH, get(|| async { "pong" }))
        .route(TASKS_PATH, get(list_tasks).post(add_task))
        .route(TASKS_DELETE_PATH, post(delete_task))
        .route(METRICS_PATH, get(|| async { gather_system_metrics() }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn agent_router(service: Arc<TaskUpdateService>) -> Router {
    Router::new()
        .route(AGENT_TASKS_PATH, post(update_tasks))
        .route(METRICS_PATH, get(|| async { gather_system_metrics() }))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: ShutdownSignal) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| SyncError::Internal {
            message: format!("listener has no address: {}", e),
        })?;
    info!("HTTP listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| SyncError::Internal {
            message: format!("HTTP server on {} failed: {}", addr, e),
        })
}

fn reply(result: Result<()>) -> Json<RpcReply> {
    Json(match result {
        Ok(()) => RpcReply::ok(),
        Err(e) if e.is_not_found() => RpcReply::error(CODE_NOT_FOUND, e.to_string()),
        Err(e @ (SyncError::InvalidMessage { .. } | SyncError::Config { .. })) => {
            RpcReply::error(CODE_BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            warn!("Request failed: {}", e);
            RpcReply::error(CODE_INTERNAL, e.to_string())
        }
    })
}

async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Json<RpcReply> {
    reply(
        state
            .registry
            .register(&request.service_id, &request.host, request.port)
            .await,
    )
}

async fn heartbeat(
    State(state): State<ApiState>,
    Json(request): Json<ServiceRequest>,
) -> Json<RpcReply> {
    reply(state.registry.update(&request.service_id).await)
}

async fn deregister(
    State(state): State<ApiState>,
    Json(request): Json<ServiceRequest>,
) -> Json<RpcReply> {
    reply(state.registry.deregister(&request.service_id).await)
}

async fn list_tasks(State(state): State<ApiState>) -> Json<AssignmentsView> {
    let dispatcher = state.manager.dispatcher();
    Json(AssignmentsView {
        replica_id: state.manager.replica_id().to_string(),
        master: state.manager.is_master(),
        unassigned: dispatcher.unassigned_count(),
        assignments: dispatcher.snapshot(),
    })
}

async fn add_task(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> Json<RpcReply> {
    let payload = TaskPayload::from(TaskKey::new(request.task_type, request.id));
    reply(state.manager.create_sync_task(payload).await)
}

async fn delete_task(
    State(state): State<ApiState>,
    Json(request): Json<TaskRequest>,
) -> Json<RpcReply> {
    reply(
        state
            .manager
            .remove_sync_task(request.task_type, request.id)
            .await,
    )
}

async fn update_tasks(
    State(service): State<Arc<TaskUpdateService>>,
    Json(request): Json<UpdateTasksRequest>,
) -> Json<RpcReply> {
    Json(service.update_tasks(request).await)
}
