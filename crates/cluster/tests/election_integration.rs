//! Leader election across several instances sharing one lock store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cluster::{ElectionConfig, InMemoryLockStore, LeaderElection, LockStore, MasterLock};
use tokio::sync::watch;

const LEASE: Duration = Duration::from_secs(15);

fn instance(store: &InMemoryLockStore, id: &str) -> LeaderElection {
    LeaderElection::new(
        Arc::new(store.clone()),
        ElectionConfig::new("servicecomb-alpha-server", id).with_lease(LEASE, Duration::from_secs(5)),
    )
}

#[tokio::test]
async fn init_lock_succeeds_once_per_service() {
    let store = InMemoryLockStore::new();
    let now = Utc::now();

    let first = store
        .init_lock(&MasterLock::new("svcA", "i1", now, LEASE))
        .await
        .unwrap();
    let second = store
        .init_lock(&MasterLock::new("svcA", "i2", now, LEASE))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn concurrent_acquire_has_single_winner() {
    let store = InMemoryLockStore::new();
    let now = Utc::now();
    let elections: Vec<_> = (0..8)
        .map(|i| Arc::new(instance(&store, &format!("alpha-{i}"))))
        .collect();

    let handles: Vec<_> = elections
        .iter()
        .cloned()
        .map(|election| tokio::spawn(async move { election.try_acquire_or_renew_at(now).await }))
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(elections.iter().filter(|e| e.is_active()).count(), 1);
}

#[tokio::test]
async fn challenger_takes_over_after_expiry_and_old_holder_steps_down() {
    let store = InMemoryLockStore::new();
    let holder = instance(&store, "i1");
    let challenger = instance(&store, "i2");
    let now = Utc::now();

    assert!(holder.try_acquire_or_renew_at(now).await);

    // Holder stops renewing; challenger keeps trying.
    let before_expiry = now + chrono::Duration::seconds(14);
    assert!(!challenger.try_acquire_or_renew_at(before_expiry).await);

    let at_expiry = now + chrono::Duration::seconds(15);
    assert!(challenger.try_acquire_or_renew_at(at_expiry).await);

    let next_renewal = at_expiry + chrono::Duration::seconds(1);
    assert!(!holder.try_acquire_or_renew_at(next_renewal).await);
    assert!(!holder.gate().is_active());

    let leader = challenger.current_leader().await.unwrap();
    assert_eq!(leader.map(|l| l.instance_id), Some("i2".to_string()));
}

#[tokio::test]
async fn release_lets_standby_claim_immediately() {
    let store = InMemoryLockStore::new();
    let holder = instance(&store, "i1");
    let standby = instance(&store, "i2");

    assert!(holder.try_acquire_or_renew().await);
    assert!(!standby.try_acquire_or_renew().await);

    holder.release().await.unwrap();
    assert!(!holder.is_active());
    assert!(standby.try_acquire_or_renew().await);
}

#[tokio::test]
async fn run_loop_acquires_and_releases_on_shutdown() {
    let store = InMemoryLockStore::new();
    let election = Arc::new(LeaderElection::new(
        Arc::new(store.clone()),
        ElectionConfig::new("svcA", "i1")
            .with_lease(Duration::from_millis(300), Duration::from_millis(100)),
    ));
    let mut gate = election.gate();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = {
        let election = election.clone();
        tokio::spawn(async move { election.run(shutdown_rx).await })
    };

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), gate.changed())
            .await
            .unwrap(),
        Some(true)
    );

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert!(!election.is_active());
    let lock = store.find("svcA").await.unwrap().unwrap();
    assert!(!lock.is_valid_at(Utc::now()));
}
