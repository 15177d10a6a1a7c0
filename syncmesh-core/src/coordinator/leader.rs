//! Master election among API replicas
//!
//! A replica becomes Master by creating the lease key while it is absent,
//! then keeps the lease alive by extending its TTL. Renewal failures are
//! retried a bounded number of times; after that the replica steps down and
//! goes back to competing for the lease.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::metrics::standard;
use crate::runtime::{RetryPolicy, ShutdownSignal};
use crate::store::{SharedStore, MASTER_LEASE_KEY};

/// Configuration for master election
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_key: String,
    /// Lifetime of the lease without renewal
    pub lease_ttl: Duration,
    /// How often a Follower tries to take the lease
    pub promote_interval: Duration,
    /// How often the Master extends the lease
    pub renew_interval: Duration,
    /// Retry budget of a single renewal
    pub renew_retry: RetryPolicy,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_key: MASTER_LEASE_KEY.into(),
            lease_ttl: Duration::from_secs(30),
            promote_interval: Duration::from_secs(10),
            renew_interval: Duration::from_secs(10),
            renew_retry: RetryPolicy::fixed(6, Duration::from_secs(3)),
        }
    }
}

/// Role of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Follower,
    Master,
}

/// Lease-based master election
pub struct LeaderElection {
    replica_id: String,
    store: Arc<dyn SharedStore>,
    config: ElectionConfig,
    is_master: AtomicBool,
    /// Incremented on every successful acquisition
    fencing_token: AtomicU64,
    role: watch::Sender<ReplicaRole>,
}

impl LeaderElection {
    pub fn new(replica_id: &str, store: Arc<dyn SharedStore>, config: ElectionConfig) -> Self {
        let (role, _) = watch::channel(ReplicaRole::Follower);
        Self {
            replica_id: replica_id.to_string(),
            store,
            config,
            is_master: AtomicBool::new(false),
            fencing_token: AtomicU64::new(0),
            role,
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> ReplicaRole {
        if self.is_master() {
            ReplicaRole::Master
        } else {
            ReplicaRole::Follower
        }
    }

    /// Watch role transitions
    pub fn subscribe(&self) -> watch::Receiver<ReplicaRole> {
        self.role.subscribe()
    }

    /// Number of times this replica has become Master
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token.load(Ordering::SeqCst)
    }

    /// Try to take the lease once. Returns true if this replica is now Master.
    pub async fn try_acquire(&self) -> Result<bool> {
        if self.is_master() {
            return Ok(true);
        }

        let won = self
            .store
            .set_nx_ex(&self.config.lease_key, &self.replica_id, self.config.lease_ttl)
            .await?;
        if won {
            self.promote();
        } else {
            debug!("Replica {} lost the lease race", self.replica_id);
        }
        Ok(won)
    }

    /// Extend the lease. `Ok(false)` means the lease belongs to someone else
    /// or has already expired.
    pub async fn renew(&self, shutdown: Option<&ShutdownSignal>) -> Result<bool> {
        let key = self.config.lease_key.as_str();
        let ttl = self.config.lease_ttl;
        self.config
            .renew_retry
            .run("lease renewal", shutdown, || {
                self.store.expire_if_eq(key, &self.replica_id, ttl)
            })
            .await
    }

    /// Give the lease up so a peer can take over without waiting for expiry
    pub async fn release(&self) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        let released = self
            .store
            .del_if_eq(&self.config.lease_key, &self.replica_id)
            .await;
        self.demote("lease released");
        released.map(|_| ())
    }

    fn promote(&self) {
        let token = self.fencing_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.is_master.store(true, Ordering::SeqCst);
        self.role.send_replace(ReplicaRole::Master);
        standard::IS_MASTER.set(1);
        standard::LEASE_ACQUISITIONS.inc();
        info!(
            "Replica {} became master (fencing token {})",
            self.replica_id, token
        );
    }

    fn demote(&self, reason: &str) {
        if self.is_master.swap(false, Ordering::SeqCst) {
            self.role.send_replace(ReplicaRole::Follower);
            standard::IS_MASTER.set(0);
            warn!("Replica {} stepped down: {}", self.replica_id, reason);
        }
    }

    /// Keep the lease until it is lost or shutdown is requested
    async fn hold_lease(&self, shutdown: &ShutdownSignal) {
        let period = self.config.renew_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            match self.renew(Some(shutdown)).await {
                Ok(true) => debug!("Replica {} renewed the lease", self.replica_id),
                Ok(false) => {
                    self.demote("lease taken over or expired");
                    return;
                }
                Err(SyncError::ShutdownInProgress) => return,
                Err(e) => {
                    error!("Lease renewal for {} gave up: {}", self.replica_id, e);
                    self.demote("renewal retries exhausted");
                    return;
                }
            }
        }
    }

    /// Run the promotion loop until shutdown, then release the lease
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        let election = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(election.config.promote_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                match election.try_acquire().await {
                    Ok(true) => {
                        election.hold_lease(&shutdown).await;
                        ticker.reset();
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Lease acquisition failed: {}", e),
                }
            }

            if let Err(e) = election.release().await {
                warn!("Failed to release lease: {}", e);
            }
            debug!("Election loop for {} stopped", election.replica_id);
        })
    }
}
