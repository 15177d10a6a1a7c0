//! Coordination manager
//!
//! Every API replica runs one manager. All replicas keep a warm dispatcher:
//! they apply task changes received from peers, reconcile against the
//! durable source and track agent membership from the registry. Only the
//! replica holding the master lease pushes task lists to agents.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::agent_client::AgentRpc;
use super::dispatcher::Dispatcher;
use super::hash_ring::RingConfig;
use super::leader::{ElectionConfig, LeaderElection};
use crate::error::{Result, SyncError};
use crate::metrics::standard;
use crate::registry::{Registry, Resolver};
use crate::runtime::{RetryPolicy, ShutdownSignal};
use crate::source::{SyncRecord, TaskSource};
use crate::store::{SharedStore, Subscription, TASK_CHANNEL};
use crate::task::{Task, TaskCommand, TaskKey, TaskMessage, TaskPayload, TaskType};

/// Configuration for the coordination manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Identity of this API replica
    pub replica_id: String,
    pub election: ElectionConfig,
    pub ring: RingConfig,
    /// Schedule of IDL sync tasks; zero disables them
    pub sync_idl_interval: Duration,
    /// Schedule of repository sync tasks; zero disables them
    pub sync_repo_interval: Duration,
    /// How often agent membership is diffed against the registry
    pub sync_agent_interval: Duration,
    /// How often the durable source is reconciled
    pub reconcile_interval: Duration,
    /// Tick of the push loop
    pub push_tick: Duration,
    /// Quiet period after the last task change before pushing
    pub update_task_interval: Duration,
    /// Longest a pending change may wait under continuous churn
    pub max_push_delay: Duration,
    /// Concurrent pushes per round
    pub max_push_concurrency: usize,
    pub publish_retry: RetryPolicy,
    /// Delay before resubscribing after the channel closed
    pub resubscribe_delay: Duration,
    pub task_channel: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            replica_id: uuid::Uuid::new_v4().to_string(),
            election: ElectionConfig::default(),
            ring: RingConfig::default(),
            sync_idl_interval: Duration::from_secs(10),
            sync_repo_interval: Duration::from_secs(10),
            sync_agent_interval: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(10),
            push_tick: Duration::from_millis(100),
            update_task_interval: Duration::from_secs(1),
            max_push_delay: Duration::from_secs(5),
            max_push_concurrency: 8,
            publish_retry: RetryPolicy::fixed(6, Duration::from_secs(3)),
            resubscribe_delay: Duration::from_secs(3),
            task_channel: TASK_CHANNEL.into(),
        }
    }
}

/// Tracks task-set changes against the last push
#[derive(Debug, Default)]
struct ChangeClock {
    generation: u64,
    pushed_generation: u64,
    last_change: Option<Instant>,
    first_pending: Option<Instant>,
}

impl ChangeClock {
    fn mark(&mut self, now: Instant) {
        self.generation += 1;
        self.last_change = Some(now);
        self.first_pending.get_or_insert(now);
    }

    /// Generation to push if the coalescing window has passed
    fn due(&self, now: Instant, quiet: Duration, max_delay: Duration) -> Option<u64> {
        if self.generation == self.pushed_generation {
            return None;
        }
        let quiet_for = self.last_change.map(|t| now.duration_since(t))?;
        let pending_for = self.first_pending.map(|t| now.duration_since(t))?;
        (quiet_for >= quiet || pending_for >= max_delay).then_some(self.generation)
    }

    fn pushed(&mut self, generation: u64) {
        self.pushed_generation = generation;
        self.first_pending = if self.generation == generation {
            None
        } else {
            self.last_change
        };
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
}

/// Outcome of one push round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushReport {
    pub agents: usize,
    pub failed: usize,
}

/// Per-replica coordination of dispatcher, registry and agents
pub struct CoordinationManager {
    config: ManagerConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    resolver: Resolver,
    election: Arc<LeaderElection>,
    store: Arc<dyn SharedStore>,
    source: Arc<dyn TaskSource>,
    agents: Arc<dyn AgentRpc>,
    known_agents: Mutex<BTreeSet<String>>,
    changes: Mutex<ChangeClock>,
    /// Serializes push rounds so agents receive bucket snapshots in order
    push_lock: tokio::sync::Mutex<()>,
    shutdown: ShutdownSignal,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationManager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn SharedStore>,
        registry: Arc<Registry>,
        source: Arc<dyn TaskSource>,
        agents: Arc<dyn AgentRpc>,
    ) -> Result<Self> {
        if config.replica_id.is_empty() {
            return Err(SyncError::Config {
                message: "replica_id must not be empty".into(),
            });
        }

        let dispatcher = Arc::new(Dispatcher::new(config.ring.clone())?);
        let election = Arc::new(LeaderElection::new(
            &config.replica_id,
            store.clone(),
            config.election.clone(),
        ));

        Ok(Self {
            resolver: Resolver::new(registry.clone()),
            config,
            dispatcher,
            registry,
            election,
            store,
            source,
            agents,
            known_agents: Mutex::new(BTreeSet::new()),
            changes: Mutex::new(ChangeClock::default()),
            push_lock: tokio::sync::Mutex::new(()),
            shutdown: ShutdownSignal::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn replica_id(&self) -> &str {
        &self.config.replica_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    /// Agents currently on the dispatcher ring
    pub fn known_agents(&self) -> Vec<String> {
        self.known_agents.lock().iter().cloned().collect()
    }

    fn schedule_for(&self, task_type: TaskType) -> Duration {
        match task_type {
            TaskType::SyncIdl => self.config.sync_idl_interval,
            TaskType::SyncRepo => self.config.sync_repo_interval,
        }
    }

    fn mark_changed(&self) {
        self.changes.lock().mark(Instant::now());
        standard::TASKS.set(self.dispatcher.task_count() as i64);
    }

    async fn publish(&self, message: TaskMessage) -> Result<()> {
        let payload = message.encode()?;
        let channel = self.config.task_channel.as_str();
        self.config
            .publish_retry
            .run("task publish", Some(&self.shutdown), || {
                self.store.publish(channel, &payload)
            })
            .await?;
        standard::MESSAGES_PUBLISHED.inc();
        Ok(())
    }

    /// Add a task locally and, when `notify`, tell the other replicas.
    ///
    /// The schedule is normalized to the configured interval of the task's
    /// type. Types with a zero interval are disabled and silently skipped.
    pub async fn add_task(&self, mut task: Task, notify: bool) -> Result<()> {
        let schedule = self.schedule_for(task.task_type);
        if schedule.is_zero() {
            debug!("Ignoring task {}: {} sync is disabled", task.id, task.task_type);
            return Ok(());
        }
        task.schedule_time = schedule;

        self.dispatcher.add_task(task.clone())?;
        self.mark_changed();

        if notify {
            self.publish(TaskMessage::add(task)).await?;
        }
        Ok(())
    }

    /// Remove the task for a payload key locally and, when `notify`, on the
    /// other replicas.
    pub async fn delete_task(&self, task_type: TaskType, id: i64, notify: bool) -> Result<()> {
        let key = TaskKey::new(task_type, id);
        let existing = self.dispatcher.task_by_key(&key);
        self.dispatcher.remove_task_by_key(&key)?;
        self.mark_changed();

        if notify {
            // Peers match on the payload key, so any task id will do
            let task = existing.unwrap_or_else(|| {
                Task::new(TaskPayload::from(key), self.schedule_for(task_type))
            });
            self.publish(TaskMessage::delete(task)).await?;
        }
        Ok(())
    }

    /// Record a new sync target in the durable source, then add its task
    /// here and on every peer
    pub async fn create_sync_task(&self, payload: TaskPayload) -> Result<()> {
        let schedule = self.schedule_for(payload.task_type());
        self.source.put_record(SyncRecord::new(payload.clone())).await?;
        self.add_task(Task::new(payload, schedule), true).await
    }

    /// Drop a sync target from the durable source and delete its task
    /// everywhere
    pub async fn remove_sync_task(&self, task_type: TaskType, id: i64) -> Result<()> {
        self.source
            .remove_record(&TaskKey::new(task_type, id))
            .await?;
        self.delete_task(task_type, id, true).await
    }

    /// Apply one raw message from the propagation channel. Never re-publishes.
    pub async fn apply_message(&self, raw: &str) -> Result<()> {
        let message = TaskMessage::decode(raw)?;
        debug!(
            "Applying {:?} for task {} ({})",
            message.command,
            message.task.id,
            message.task.key()
        );

        match message.command {
            TaskCommand::Add => self.add_task(message.task, false).await?,
            TaskCommand::Delete => {
                let key = message.task.key();
                self.delete_task(key.task_type, key.id, false).await?
            }
        }
        standard::MESSAGES_APPLIED.inc();
        Ok(())
    }

    /// Page through the durable source and add every record that has no
    /// task yet. After a complete pass, tasks whose record is gone are
    /// removed. A page error aborts the pass before anything is removed.
    pub async fn reconcile_from_source(&self) -> Result<ReconcileReport> {
        // Tasks added after this point were written to the source first, so
        // only keys known before paging starts are candidates for removal
        let before: Vec<TaskKey> = self.dispatcher.all_tasks().iter().map(Task::key).collect();

        let mut page = 1;
        let mut seen = 0;
        let mut listed: HashSet<TaskKey> = HashSet::new();
        let mut report = ReconcileReport::default();

        loop {
            let batch = self.source.pending_sync_tasks(page).await?;
            if batch.records.is_empty() {
                break;
            }
            seen += batch.records.len();

            for record in batch.records {
                let key = record.payload.key();
                listed.insert(key);
                if self.dispatcher.contains_key(&key) {
                    continue;
                }
                let task = Task::new(record.payload, self.schedule_for(key.task_type));
                match self.add_task(task, false).await {
                    Ok(()) if self.dispatcher.contains_key(&key) => report.added += 1,
                    Ok(()) => {}
                    Err(e) => error!("Failed to add sync task for record {}: {}", record.id, e),
                }
            }

            if seen >= batch.total {
                break;
            }
            page += 1;
        }

        for key in before.into_iter().filter(|key| !listed.contains(key)) {
            match self.dispatcher.remove_task_by_key(&key) {
                Ok(()) => report.removed += 1,
                Err(e) => error!("Failed to remove task {}: {}", key, e),
            }
        }
        if report.removed > 0 {
            self.mark_changed();
        }

        if report != ReconcileReport::default() {
            info!(
                "Reconciled from source ({} records): {} added, {} removed",
                seen, report.added, report.removed
            );
        }
        Ok(report)
    }

    /// Align dispatcher membership with the registry's live agents. Returns
    /// true if membership changed. A change is pushed by the push loop like
    /// any other change of the task set.
    pub async fn sync_service(&self) -> bool {
        let live: BTreeSet<String> = self.registry.service_ids().into_iter().collect();
        let (joined, left): (Vec<String>, Vec<String>) = {
            let known = self.known_agents.lock();
            (
                live.difference(&known).cloned().collect(),
                known.difference(&live).cloned().collect(),
            )
        };

        for service_id in &joined {
            if let Err(e) = self.dispatcher.add_service(service_id) {
                error!("Failed to add service {}: {}", service_id, e);
            }
        }
        for service_id in &left {
            if let Err(e) = self.dispatcher.del_service(service_id) {
                error!("Failed to remove service {}: {}", service_id, e);
            }
        }

        standard::KNOWN_AGENTS.set(live.len() as i64);
        *self.known_agents.lock() = live;

        let changed = !joined.is_empty() || !left.is_empty();
        if changed {
            info!("Agent membership changed: +{:?} -{:?}", joined, left);
            self.mark_changed();
        }
        changed
    }

    async fn push_to_agent(&self, service_id: &str, fencing_token: u64) -> Result<()> {
        let endpoint = self
            .resolver
            .resolve_service(service_id)
            .ok_or_else(|| SyncError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;
        let tasks = self.dispatcher.tasks_by_service(service_id);

        let reply = self
            .agents
            .update_tasks(&endpoint, tasks, fencing_token)
            .await?;
        if !reply.is_ok() {
            return Err(SyncError::Rpc {
                endpoint: endpoint.address,
                reason: format!("code {}: {}", reply.code, reply.msg),
            });
        }
        Ok(())
    }

    /// Push every known agent its current bucket. Failures are logged and
    /// counted, never propagated. Rounds never overlap, so a later round
    /// always carries a snapshot at least as new as an earlier one.
    pub async fn update_agent_tasks(&self) -> PushReport {
        let _round = self.push_lock.lock().await;
        let agents = self.known_agents();
        if agents.is_empty() {
            return PushReport::default();
        }

        let started = Instant::now();
        let fencing_token = self.election.fencing_token();
        let failures: Vec<String> = stream::iter(agents.iter().cloned())
            .map(|service_id: String| async move {
                self.push_to_agent(&service_id, fencing_token)
                    .await
                    .map_err(|e| format!("{service_id}: {e}"))
            })
            .buffer_unordered(self.config.max_push_concurrency.max(1))
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        standard::PUSH_DURATION.observe(started.elapsed());
        standard::TASK_PUSHES.inc_by((agents.len() - failures.len()) as u64);
        standard::TASK_PUSH_FAILURES.inc_by(failures.len() as u64);

        if failures.is_empty() {
            debug!("Pushed tasks to {} agents", agents.len());
        } else {
            error!(
                "Task push failed for {} of {} agents: {}",
                failures.len(),
                agents.len(),
                failures.join("; ")
            );
        }

        PushReport {
            agents: agents.len(),
            failed: failures.len(),
        }
    }

    /// One tick of the push loop. Returns true if a push happened.
    pub async fn push_if_due(&self) -> bool {
        if !self.is_master() {
            return false;
        }
        let due = self.changes.lock().due(
            Instant::now(),
            self.config.update_task_interval,
            self.config.max_push_delay,
        );
        let Some(generation) = due else {
            return false;
        };

        debug!("Task set changed, pushing generation {}", generation);
        self.update_agent_tasks().await;
        self.changes.lock().pushed(generation);
        true
    }

    /// Subscribe to the propagation channel and start every background loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let subscription = self.store.subscribe(&self.config.task_channel).await?;
        info!(
            "Coordination manager {} starting (channel {})",
            self.config.replica_id, self.config.task_channel
        );

        let mut handles = vec![
            self.election.start(self.shutdown.clone()),
            self.spawn_watch_loop(subscription),
            self.spawn_sync_service_loop(),
            self.spawn_push_loop(),
        ];
        if !self.config.reconcile_interval.is_zero() {
            handles.push(self.spawn_reconcile_loop());
        }
        self.handles.lock().extend(handles);
        Ok(())
    }

    /// Stop every loop and release the master lease
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Coordination manager {} stopped", self.config.replica_id);
    }

    fn spawn_watch_loop(self: &Arc<Self>, first: Subscription) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let shutdown = manager.shutdown.clone();
            let mut subscription = Some(first);

            loop {
                let mut active = match subscription.take() {
                    Some(active) => active,
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(manager.config.resubscribe_delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                        match manager.store.subscribe(&manager.config.task_channel).await {
                            Ok(active) => active,
                            Err(e) => {
                                warn!("Resubscribe to {} failed: {}", manager.config.task_channel, e);
                                continue;
                            }
                        }
                    }
                };

                let stopping = loop {
                    tokio::select! {
                        message = active.recv() => match message {
                            Some(raw) => {
                                if let Err(e) = manager.apply_message(&raw).await {
                                    warn!("Skipping task message {:?}: {}", raw, e);
                                }
                            }
                            None => break false,
                        },
                        _ = shutdown.cancelled() => break true,
                    }
                };

                if !stopping {
                    warn!("Subscription to {} closed", active.channel());
                }
                active.close();
                if stopping {
                    break;
                }
            }
            debug!("Task channel watcher stopped");
        })
    }

    fn spawn_sync_service_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.config.sync_agent_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sync_service().await;
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
        })
    }

    fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.config.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.reconcile_from_source().await {
                            warn!("Reconciliation pass failed: {}", e);
                        }
                    }
                    _ = manager.shutdown.cancelled() => break,
                }
            }
        })
    }

    fn spawn_push_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(manager.config.push_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut was_master = false;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = manager.shutdown.cancelled() => break,
                }

                let master = manager.is_master();
                if master && !was_master {
                    // New master pushes its full view once
                    manager.mark_changed();
                }
                was_master = master;
                manager.push_if_due().await;
            }
        })
    }
}
