//! Bounded worker pool executing dispatched sync tasks
//!
//! Each worker owns a single-slot task channel. An idle worker offers that
//! channel on the shared `available` queue; the dispatch loop takes an offer
//! for every task in the current list, so at most `workers` tasks run at
//! once and dispatch blocks while every worker is busy. A full pass over
//! the list is followed by a pause that stretches the round to at least
//! `min_round_interval`.
//!
//! Every handed-off task carries a permit of the `in_flight` semaphore until
//! its execution ends. Replacing the list takes all permits, so no task of
//! the old generation is still running when the new one starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;
use crate::task::{Task, TaskPayload};

/// Hard upper bound on workers per agent
pub const MAX_WORKERS: usize = 16;

/// Runs the actual sync for one task payload
#[async_trait::async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn execute_sync(&self, payload: &TaskPayload) -> Result<()>;
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers, clamped to `1..=MAX_WORKERS`
    pub workers: usize,
    /// Minimum duration of one pass over the task list
    pub min_round_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            min_round_interval: Duration::from_secs(30),
        }
    }
}

/// Execution counters
#[derive(Debug, Default)]
pub struct PoolStats {
    dispatched: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    rounds: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub dispatched: u64,
    pub executed: u64,
    pub failed: u64,
    pub rounds: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
        }
    }
}

type TaskSlot = mpsc::Sender<(Task, OwnedSemaphorePermit)>;

/// One dispatch loop over one task list
struct Generation {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Agent-side executor pool
pub struct WorkerPool {
    config: WorkerPoolConfig,
    available: Arc<Mutex<mpsc::Receiver<TaskSlot>>>,
    generation: Mutex<Option<Generation>>,
    tasks: RwLock<Vec<Task>>,
    in_flight: Arc<Semaphore>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    shutdown: ShutdownSignal,
}

impl WorkerPool {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn new(config: WorkerPoolConfig, executor: Arc<dyn SyncExecutor>) -> Self {
        let count = config.workers.clamp(1, MAX_WORKERS);
        if count != config.workers {
            warn!("Worker count {} clamped to {}", config.workers, count);
        }

        let (available_tx, available_rx) = mpsc::channel(count);
        let stats = Arc::new(PoolStats::default());
        let shutdown = ShutdownSignal::new();

        let workers = (0..count)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    executor.clone(),
                    available_tx.clone(),
                    shutdown.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!("Worker pool started with {} workers", count);

        Self {
            config: WorkerPoolConfig {
                workers: count,
                ..config
            },
            available: Arc::new(Mutex::new(available_rx)),
            generation: Mutex::new(None),
            tasks: RwLock::new(Vec::new()),
            in_flight: Arc::new(Semaphore::new(count)),
            workers: parking_lot::Mutex::new(workers),
            stats,
            shutdown,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    pub fn stats(&self) -> PoolSnapshot {
        self.stats.snapshot()
    }

    /// Currently installed task list
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    /// Replace the task list.
    ///
    /// The running dispatch loop is cancelled and awaited, then every task
    /// already handed to a worker is allowed to finish. Only then does the
    /// new list start, so two generations never overlap.
    pub async fn update_tasks(&self, tasks: Vec<Task>) {
        let mut generation = self.generation.lock().await;
        if let Some(current) = generation.take() {
            let _ = current.cancel.send(true);
            if let Err(e) = current.handle.await {
                warn!("Dispatch loop ended abnormally: {}", e);
            }
            self.drain().await;
        }

        info!("Installing {} tasks", tasks.len());
        *self.tasks.write() = tasks.clone();

        if tasks.is_empty() || self.shutdown.is_shutdown() {
            return;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch(
            Arc::new(tasks),
            self.available.clone(),
            cancel_rx,
            self.in_flight.clone(),
            self.config.min_round_interval,
            self.stats.clone(),
        ));
        *generation = Some(Generation { cancel, handle });
    }

    /// Wait until no handed-off task is executing
    async fn drain(&self) {
        let started = Instant::now();
        if let Ok(permits) = self.in_flight.acquire_many(self.config.workers as u32).await {
            drop(permits);
            debug!("Previous generation drained in {:?}", started.elapsed());
        }
    }

    /// Stop dispatching and let every worker exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.shutdown.shutdown();

        if let Some(current) = self.generation.lock().await.take() {
            let _ = current.cancel.send(true);
            let _ = current.handle.await;
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        debug!("Worker pool stopped");
    }
}

async fn run_worker(
    id: usize,
    executor: Arc<dyn SyncExecutor>,
    available: mpsc::Sender<TaskSlot>,
    shutdown: ShutdownSignal,
    stats: Arc<PoolStats>,
) {
    let (slot, mut inbox) = mpsc::channel::<(Task, OwnedSemaphorePermit)>(1);

    loop {
        // Capacity equals the worker count, so offering never waits for long
        tokio::select! {
            sent = available.send(slot.clone()) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }

        let (task, permit) = tokio::select! {
            task = inbox.recv() => match task {
                Some(handoff) => handoff,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let started = Instant::now();
        match executor.execute_sync(&task.payload).await {
            Ok(()) => {
                stats.executed.fetch_add(1, Ordering::Relaxed);
                standard::SYNC_EXECUTIONS.inc();
                debug!("Worker {} synced {} ({})", id, task.key(), task.id);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                standard::SYNC_FAILURES.inc();
                error!("Worker {} failed to sync {} ({}): {}", id, task.key(), task.id, e);
            }
        }
        standard::SYNC_DURATION.observe(started.elapsed());
        drop(permit);
    }

    debug!("Worker {} exited", id);
}

async fn dispatch(
    tasks: Arc<Vec<Task>>,
    available: Arc<Mutex<mpsc::Receiver<TaskSlot>>>,
    mut cancel: watch::Receiver<bool>,
    in_flight: Arc<Semaphore>,
    min_round_interval: Duration,
    stats: Arc<PoolStats>,
) {
    let mut available = available.lock().await;

    loop {
        let started = Instant::now();

        for task in tasks.iter() {
            let mut pending = task.clone();
            loop {
                let slot = tokio::select! {
                    biased;
                    _ = cancel.changed() => return,
                    slot = available.recv() => match slot {
                        Some(slot) => slot,
                        None => return,
                    },
                };
                // Never blocks for long: at most `workers` permits are out
                let Ok(permit) = in_flight.clone().acquire_owned().await else {
                    return;
                };
                match slot.send((pending, permit)).await {
                    Ok(()) => break,
                    // Worker went away after offering itself; try the next one
                    Err(mpsc::error::SendError((task, _))) => pending = task,
                }
            }
            stats.dispatched.fetch_add(1, Ordering::Relaxed);
        }

        stats.rounds.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed();
        if elapsed < min_round_interval {
            tokio::select! {
                _ = tokio::time::sleep(min_round_interval - elapsed) => {}
                _ = cancel.changed() => return,
            }
        }
    }
}
