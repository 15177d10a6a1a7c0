//! HTTP round trips between the registry client, the API router and the
//! agent router

use std::sync::Arc;
use std::time::Duration;

use syncmesh_core::coordinator::{
    AgentClientConfig, AgentRpc, CoordinationManager, HttpAgentClient, ManagerConfig,
};
use syncmesh_core::error::Result;
use syncmesh_core::http::{agent_router, api_router, serve, ApiState};
use syncmesh_core::protocol::{
    AssignmentsView, RpcReply, TaskRequest, TASKS_DELETE_PATH, TASKS_PATH,
};
use syncmesh_core::registry::{Registry, RegistryConfig, Resolver};
use syncmesh_core::runtime::ShutdownSignal;
use syncmesh_core::source::StaticTaskSource;
use syncmesh_core::store::{MemoryStore, SharedStore};
use syncmesh_core::task::{Task, TaskPayload, TaskType};
use syncmesh_core::worker::{
    RegistryClient, RegistryClientConfig, SyncExecutor, TaskUpdateService, WorkerPool,
    WorkerPoolConfig,
};
use tokio::net::TcpListener;

struct NoopExecutor;

#[async_trait::async_trait]
impl SyncExecutor for NoopExecutor {
    async fn execute_sync(&self, _payload: &TaskPayload) -> Result<()> {
        Ok(())
    }
}

struct Api {
    addr: String,
    registry: Arc<Registry>,
    manager: Arc<CoordinationManager>,
}

async fn start_api(shutdown: &ShutdownSignal) -> Api {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(store.clone(), RegistryConfig::default()));
    let manager = Arc::new(
        CoordinationManager::new(
            ManagerConfig::default(),
            store,
            registry.clone(),
            Arc::new(StaticTaskSource::default()),
            Arc::new(HttpAgentClient::new(AgentClientConfig::default()).unwrap()),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let router = api_router(ApiState {
        registry: registry.clone(),
        manager: manager.clone(),
    });
    tokio::spawn(serve(listener, router, shutdown.clone()));

    Api {
        addr,
        registry,
        manager,
    }
}

#[tokio::test]
async fn test_registry_client_lifecycle() {
    let shutdown = ShutdownSignal::new();
    let api = start_api(&shutdown).await;

    let client = RegistryClient::new(RegistryClientConfig {
        api_addr: format!("http://{}", api.addr),
        service_id: "agent-1".into(),
        host: "10.0.0.5".into(),
        port: 9100,
        ..Default::default()
    })
    .unwrap();

    client.register().await.unwrap();
    let entry = api.registry.get("agent-1").unwrap();
    assert_eq!(entry.address(), "10.0.0.5:9100");

    client.heartbeat().await.unwrap();

    // A replica that lost the entry gets a fresh registration
    api.registry.deregister("agent-1").await.unwrap();
    client.heartbeat().await.unwrap();
    assert!(api.registry.get("agent-1").is_some());

    client.deregister().await.unwrap();
    assert!(api.registry.get("agent-1").is_none());

    shutdown.shutdown();
}

#[tokio::test]
async fn test_task_admin_endpoints() {
    let shutdown = ShutdownSignal::new();
    let api = start_api(&shutdown).await;
    api.registry.register("agent-1", "10.0.0.1", 9000).await.unwrap();
    api.manager.sync_service().await;

    let http = reqwest::Client::new();
    let url = format!("http://{}{}", api.addr, TASKS_PATH);
    let reply: RpcReply = http
        .post(&url)
        .json(&TaskRequest {
            task_type: TaskType::SyncRepo,
            id: 12,
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(reply.is_ok(), "{:?}", reply);

    let view: AssignmentsView = http.get(&url).send().await.unwrap().json().await.unwrap();
    assert!(!view.master);
    assert_eq!(view.unassigned, 0);
    assert_eq!(view.assignments["agent-1"].len(), 1);
    assert_eq!(
        view.assignments["agent-1"][0].payload,
        TaskPayload::SyncRepo { repo_id: 12 }
    );

    let delete_url = format!("http://{}{}", api.addr, TASKS_DELETE_PATH);
    let reply: RpcReply = http
        .post(&delete_url)
        .json(&TaskRequest {
            task_type: TaskType::SyncRepo,
            id: 12,
        })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(reply.is_ok(), "{:?}", reply);
    assert_eq!(api.manager.dispatcher().task_count(), 0);
    assert_eq!(api.manager.reconcile_from_source().await.unwrap().added, 0);

    shutdown.shutdown();
}

#[tokio::test]
async fn test_push_reaches_agent_pool() {
    let shutdown = ShutdownSignal::new();
    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig::default(),
        Arc::new(NoopExecutor),
    ));
    let service = Arc::new(TaskUpdateService::new(pool.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve(listener, agent_router(service.clone()), shutdown.clone()));

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(Registry::new(store, RegistryConfig::default()));
    registry.register("agent-1", "127.0.0.1", port).await.unwrap();
    let endpoint = Resolver::new(registry).resolve_service("agent-1").unwrap();

    let client = HttpAgentClient::new(AgentClientConfig::default()).unwrap();
    let tasks = vec![
        Task::new(TaskPayload::SyncIdl { idl_id: 1 }, Duration::from_secs(10)),
        Task::new(TaskPayload::SyncRepo { repo_id: 2 }, Duration::from_secs(10)),
    ];
    let reply = client.update_tasks(&endpoint, tasks.clone(), 3).await.unwrap();

    assert!(reply.is_ok());
    assert_eq!(pool.tasks(), tasks);
    assert_eq!(service.last_fencing_token(), 3);

    pool.stop().await;
    shutdown.shutdown();
}
