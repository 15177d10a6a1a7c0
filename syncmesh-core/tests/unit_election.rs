//! Unit tests for lease-based master election

use std::sync::Arc;
use std::time::Duration;

use syncmesh_core::coordinator::{ElectionConfig, LeaderElection, ReplicaRole};
use syncmesh_core::runtime::{RetryPolicy, ShutdownSignal};
use syncmesh_core::store::{MemoryStore, SharedStore, MASTER_LEASE_KEY};

fn replica(id: &str, store: Arc<dyn SharedStore>) -> Arc<LeaderElection> {
    Arc::new(LeaderElection::new(
        id,
        store,
        ElectionConfig {
            lease_ttl: Duration::from_secs(30),
            promote_interval: Duration::from_secs(10),
            renew_interval: Duration::from_secs(10),
            renew_retry: RetryPolicy::fixed(2, Duration::from_millis(100)),
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn test_concurrent_race_has_one_winner() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = replica("replica-a", store.clone());
    let b = replica("replica-b", store.clone());

    let (won_a, won_b) = tokio::join!(a.try_acquire(), b.try_acquire());
    let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());

    assert!(won_a ^ won_b, "exactly one replica must win");
    assert_eq!(a.is_master(), won_a);
    assert_eq!(b.is_master(), won_b);

    let holder = store.get(MASTER_LEASE_KEY).await.unwrap();
    let expected = if won_a { "replica-a" } else { "replica-b" };
    assert_eq!(holder.as_deref(), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_after_expiry() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = replica("replica-a", store.clone());
    let b = replica("replica-b", store.clone());

    assert!(a.try_acquire().await.unwrap());
    assert!(!b.try_acquire().await.unwrap());

    // A stops renewing
    tokio::time::advance(Duration::from_secs(31)).await;

    assert!(b.try_acquire().await.unwrap());
    assert!(b.is_master());
    assert_eq!(b.fencing_token(), 1);

    // A's stale renewal must not extend B's lease
    assert!(!a.renew(None).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_election_loops_hand_over_on_shutdown() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let a = replica("replica-a", store.clone());
    let b = replica("replica-b", store.clone());
    let shutdown_a = ShutdownSignal::new();
    let shutdown_b = ShutdownSignal::new();

    let mut roles_a = a.subscribe();
    let handle_a = a.start(shutdown_a.clone());
    roles_a.changed().await.unwrap();
    assert_eq!(*roles_a.borrow(), ReplicaRole::Master);

    let handle_b = b.start(shutdown_b.clone());
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(a.is_master(), "renewal must keep the lease alive");
    assert!(!b.is_master());

    // Stopping A releases the lease instead of waiting for expiry
    shutdown_a.shutdown();
    handle_a.await.unwrap();
    assert!(!a.is_master());
    assert_eq!(store.get(MASTER_LEASE_KEY).await.unwrap(), None);

    let mut roles_b = b.subscribe();
    tokio::time::timeout(Duration::from_secs(15), roles_b.wait_for(|r| *r == ReplicaRole::Master))
        .await
        .expect("follower never took over")
        .unwrap();

    shutdown_b.shutdown();
    handle_b.await.unwrap();
}
