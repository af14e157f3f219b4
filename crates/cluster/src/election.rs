//! Lease acquisition, renewal and release.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::{ClusterError, LockStore, MasterLock, Result};

/// Marks "no lease held" in [`LeaseDeadline`].
const NOT_HELD: i64 = i64::MIN;

/// Leader election settings.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Lease key shared by every instance of the cluster.
    pub service_name: String,
    /// This instance's holder id.
    pub instance_id: String,
    pub lease_duration: Duration,
    /// How often the lease is acquired or renewed. At most a third of
    /// `lease_duration`, so one missed renewal never loses the lease.
    pub renew_interval: Duration,
}

impl ElectionConfig {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease_duration: Duration, renew_interval: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew_interval;
        self
    }

    /// Renewal cadence clamped to a third of the lease.
    pub fn effective_renew_interval(&self) -> Duration {
        let max = self.lease_duration / 3;
        let interval = self.renew_interval.min(max);
        interval.max(Duration::from_millis(1))
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            service_name: "servicecomb-alpha-server".to_string(),
            instance_id: "alpha-0".to_string(),
            lease_duration: Duration::from_millis(15_000),
            renew_interval: Duration::from_millis(5_000),
        }
    }
}

/// Expiry of the lease this instance last wrote, as epoch milliseconds.
///
/// Shared between the election and its gates so that an expired lease reads
/// as inactive even while a renewal is still in flight.
#[derive(Debug, Clone)]
struct LeaseDeadline(Arc<AtomicI64>);

impl LeaseDeadline {
    fn new(initial: i64) -> Self {
        Self(Arc::new(AtomicI64::new(initial)))
    }

    fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Acquire) {
            NOT_HELD => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    fn set(&self, until: Option<DateTime<Utc>>) {
        let millis = until.map_or(NOT_HELD, |t| t.timestamp_millis());
        self.0.store(millis, Ordering::Release);
    }

    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.0.load(Ordering::Acquire)
    }
}

/// Read side of the "is this instance active" signal.
///
/// Cheap to clone; the state machine and dispatchers check it before they
/// mutate shared state or push commands. A gate turns inactive on its own
/// once the held lease runs out.
#[derive(Debug, Clone)]
pub struct LeaderGate {
    rx: watch::Receiver<bool>,
    deadline: LeaseDeadline,
}

impl LeaderGate {
    /// A gate that is permanently active, for single-instance deployments.
    pub fn always_active() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self {
            rx,
            deadline: LeaseDeadline::new(i64::MAX),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.rx.borrow() && self.deadline.is_valid_at(Utc::now())
    }

    /// Waits until the signal changes, returning the new value.
    ///
    /// Returns None once the election that feeds the gate is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Owns the lease lifecycle for one coordinator instance.
pub struct LeaderElection {
    store: Arc<dyn LockStore>,
    config: ElectionConfig,
    active: watch::Sender<bool>,
    initialized: AtomicBool,
    /// Expiry of the last lease this instance successfully wrote.
    held_until: LeaseDeadline,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn LockStore>, config: ElectionConfig) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            store,
            config,
            active,
            initialized: AtomicBool::new(false),
            held_until: LeaseDeadline::new(NOT_HELD),
        }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Returns a gate that follows this election.
    pub fn gate(&self) -> LeaderGate {
        LeaderGate {
            rx: self.active.subscribe(),
            deadline: self.held_until.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow() && self.held_until.is_valid_at(Utc::now())
    }

    /// Acquires or renews the lease at the current time.
    pub async fn try_acquire_or_renew(&self) -> bool {
        self.try_acquire_or_renew_at(Utc::now()).await
    }

    /// Acquires or renews the lease as of `now`.
    ///
    /// Returns whether this instance is the active holder after the call.
    /// Losing the conditional write demotes immediately. A storage failure,
    /// including a store call outlasting the renew interval, demotes only once
    /// the last lease this instance wrote has run out.
    #[tracing::instrument(skip(self), fields(service = %self.config.service_name, instance = %self.config.instance_id))]
    pub async fn try_acquire_or_renew_at(&self, now: DateTime<Utc>) -> bool {
        let lock = MasterLock::new(
            &self.config.service_name,
            &self.config.instance_id,
            now,
            self.config.lease_duration,
        );

        match self.write_lease(&lock).await {
            Ok(true) => {
                self.set_held_until(Some(lock.expire_time));
                self.set_active(true);
            }
            Ok(false) => {
                metrics::counter!("alpha_lease_contention_total").increment(1);
                tracing::debug!("lease held by another instance");
                self.set_held_until(None);
                self.set_active(false);
            }
            Err(e) => {
                metrics::counter!("alpha_lease_renew_failures_total").increment(1);
                let still_valid = self.held_until().is_some_and(|until| now < until);
                if still_valid {
                    tracing::warn!(error = %e, "lease renewal failed, keeping current lease");
                } else {
                    tracing::error!(error = %e, "lease renewal failed and lease has run out");
                    self.set_held_until(None);
                    self.set_active(false);
                }
            }
        }

        self.is_active()
    }

    async fn write_lease(&self, lock: &MasterLock) -> Result<bool> {
        let limit = self.config.effective_renew_interval();
        if !self.initialized.load(Ordering::Acquire) {
            let created = bounded(limit, self.store.init_lock(lock)).await?;
            self.initialized.store(true, Ordering::Release);
            if created {
                tracing::debug!("lease row created");
                return Ok(true);
            }
        }
        bounded(limit, self.store.update_lock(lock)).await
    }

    /// Releases the lease if this instance holds it, so a standby can claim
    /// it without waiting for expiry.
    #[tracing::instrument(skip(self), fields(service = %self.config.service_name))]
    pub async fn release(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let released = self
            .store
            .unlock(
                &self.config.service_name,
                &self.config.instance_id,
                Utc::now(),
            )
            .await;
        self.set_held_until(None);
        self.set_active(false);

        if released? {
            tracing::info!("lease released");
        }
        Ok(())
    }

    /// Returns the current valid holder, if any.
    pub async fn current_leader(&self) -> Result<Option<MasterLock>> {
        let now = Utc::now();
        Ok(self
            .store
            .find(&self.config.service_name)
            .await?
            .filter(|lock| lock.is_valid_at(now)))
    }

    /// Renews the lease on a fixed cadence until `shutdown` flips to true,
    /// then releases it.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.effective_renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            lease_ms = self.config.lease_duration.as_millis() as u64,
            renew_ms = self.config.effective_renew_interval().as_millis() as u64,
            "leader election started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.try_acquire_or_renew().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.release().await {
            tracing::error!(error = %e, "failed to release lease on shutdown");
        }
    }

    fn held_until(&self) -> Option<DateTime<Utc>> {
        self.held_until.get()
    }

    fn set_held_until(&self, until: Option<DateTime<Utc>>) {
        self.held_until.set(until);
    }

    fn set_active(&self, active: bool) {
        let changed = self.active.send_if_modified(|current| {
            if *current == active {
                return false;
            }
            *current = active;
            true
        });
        if changed {
            metrics::counter!("alpha_leadership_changes_total").increment(1);
            metrics::gauge!("alpha_is_leader").set(if active { 1.0 } else { 0.0 });
            if active {
                tracing::info!(instance = %self.config.instance_id, "leadership gained");
            } else {
                tracing::warn!(instance = %self.config.instance_id, "leadership lost");
            }
        }
    }
}

/// Runs a lock store call, failing it once `limit` has passed.
async fn bounded<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ClusterError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::InMemoryLockStore;

    fn election(store: &InMemoryLockStore, instance: &str) -> LeaderElection {
        LeaderElection::new(
            Arc::new(store.clone()),
            ElectionConfig::new("svcA", instance)
                .with_lease(Duration::from_secs(15), Duration::from_secs(5)),
        )
    }

    /// Store that fails every call after the first successful init.
    struct FlakyStore {
        inner: InMemoryLockStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl LockStore for FlakyStore {
        async fn init_lock(&self, lock: &MasterLock) -> Result<bool> {
            self.check()?;
            self.inner.init_lock(lock).await
        }

        async fn update_lock(&self, lock: &MasterLock) -> Result<bool> {
            self.check()?;
            self.inner.update_lock(lock).await
        }

        async fn unlock(
            &self,
            service_name: &str,
            instance_id: &str,
            expire_time: DateTime<Utc>,
        ) -> Result<bool> {
            self.check()?;
            self.inner.unlock(service_name, instance_id, expire_time).await
        }

        async fn find(&self, service_name: &str) -> Result<Option<MasterLock>> {
            self.check()?;
            self.inner.find(service_name).await
        }
    }

    impl FlakyStore {
        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClusterError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    #[test]
    fn renew_interval_is_clamped_to_a_third() {
        let config = ElectionConfig::new("svcA", "i1")
            .with_lease(Duration::from_millis(9_000), Duration::from_millis(8_000));
        assert_eq!(config.effective_renew_interval(), Duration::from_millis(3_000));

        let default = ElectionConfig::default();
        assert_eq!(default.effective_renew_interval(), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn first_instance_wins_second_stays_standby() {
        let store = InMemoryLockStore::new();
        let first = election(&store, "i1");
        let second = election(&store, "i2");
        let now = Utc::now();

        assert!(first.try_acquire_or_renew_at(now).await);
        assert!(!second.try_acquire_or_renew_at(now).await);
        assert!(first.gate().is_active());
        assert!(!second.gate().is_active());
    }

    #[tokio::test]
    async fn holder_renews_before_expiry() {
        let store = InMemoryLockStore::new();
        let first = election(&store, "i1");
        let now = Utc::now();

        assert!(first.try_acquire_or_renew_at(now).await);
        let renewed_at = now + chrono::Duration::seconds(5);
        assert!(first.try_acquire_or_renew_at(renewed_at).await);

        let lock = store.find("svcA").await.unwrap().unwrap();
        assert_eq!(lock.locked_time, renewed_at);
        assert_eq!(lock.expire_time, renewed_at + chrono::Duration::seconds(15));
    }

    #[tokio::test]
    async fn storage_failure_keeps_leadership_until_lease_runs_out() {
        let flaky = Arc::new(FlakyStore {
            inner: InMemoryLockStore::new(),
            failing: AtomicBool::new(false),
        });
        let election = LeaderElection::new(
            flaky.clone(),
            ElectionConfig::new("svcA", "i1")
                .with_lease(Duration::from_secs(15), Duration::from_secs(5)),
        );
        let now = Utc::now();
        assert!(election.try_acquire_or_renew_at(now).await);

        flaky.failing.store(true, Ordering::SeqCst);
        assert!(
            election
                .try_acquire_or_renew_at(now + chrono::Duration::seconds(5))
                .await
        );
        assert!(
            election
                .try_acquire_or_renew_at(now + chrono::Duration::seconds(10))
                .await
        );
        assert!(
            !election
                .try_acquire_or_renew_at(now + chrono::Duration::seconds(15))
                .await
        );
    }

    #[tokio::test]
    async fn gate_observes_changes() {
        let store = InMemoryLockStore::new();
        let election = election(&store, "i1");
        let mut gate = election.gate();

        election.try_acquire_or_renew_at(Utc::now()).await;
        assert_eq!(gate.changed().await, Some(true));

        election.release().await.unwrap();
        assert_eq!(gate.changed().await, Some(false));
    }

    /// Store whose renewals stall far beyond any lease.
    struct StallingStore {
        inner: InMemoryLockStore,
    }

    #[async_trait]
    impl LockStore for StallingStore {
        async fn init_lock(&self, lock: &MasterLock) -> Result<bool> {
            self.inner.init_lock(lock).await
        }

        async fn update_lock(&self, _lock: &MasterLock) -> Result<bool> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }

        async fn unlock(
            &self,
            service_name: &str,
            instance_id: &str,
            expire_time: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.unlock(service_name, instance_id, expire_time).await
        }

        async fn find(&self, service_name: &str) -> Result<Option<MasterLock>> {
            self.inner.find(service_name).await
        }
    }

    #[tokio::test]
    async fn stalled_renewal_cannot_outlive_the_lease() {
        let shared = InMemoryLockStore::new();
        let lease = Duration::from_millis(300);
        let holder = LeaderElection::new(
            Arc::new(StallingStore {
                inner: shared.clone(),
            }),
            ElectionConfig::new("svcA", "i1").with_lease(lease, Duration::from_millis(100)),
        );
        let challenger = LeaderElection::new(
            Arc::new(shared.clone()),
            ElectionConfig::new("svcA", "i2").with_lease(lease, Duration::from_millis(100)),
        );
        let gate = holder.gate();

        assert!(holder.try_acquire_or_renew().await);
        assert!(gate.is_active());

        // The stalled renewal gives up after the renew interval.
        let started = std::time::Instant::now();
        assert!(holder.try_acquire_or_renew().await);
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!gate.is_active());
        assert!(!holder.is_active());

        assert!(challenger.try_acquire_or_renew().await);
        assert!(!(gate.is_active() && challenger.is_active()));

        // The next renewal attempt reports the lost tenure to watchers.
        assert!(!holder.try_acquire_or_renew().await);
    }

    #[test]
    fn always_active_gate() {
        assert!(LeaderGate::always_active().is_active());
    }
}
