//! The leadership lease and its storage port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// The cluster leadership lease, one per coordinated service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLock {
    /// Lease key.
    pub service_name: String,
    /// Current holder.
    pub instance_id: String,
    /// Last acquisition or renewal.
    pub locked_time: DateTime<Utc>,
    /// Deadline after which another instance may take the lease.
    pub expire_time: DateTime<Utc>,
}

impl MasterLock {
    /// Creates a lease held by `instance_id` from `now` for `lease_duration`.
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Self {
        let lease = chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::MAX);
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            locked_time: now,
            expire_time: now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// A holder is valid iff `now < expire_time`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_time
    }

    pub fn is_held_by(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }
}

/// Persistence contract for the leadership lease.
///
/// Every write is conditional so that two instances can never both believe
/// they hold a valid lease.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Creates the lease row if none exists for `lock.service_name`.
    ///
    /// Returns false when the row is already present.
    async fn init_lock(&self, lock: &MasterLock) -> Result<bool>;

    /// Claims or renews the lease.
    ///
    /// Succeeds only if the stored lease has expired at `lock.locked_time`
    /// or is already held by `lock.instance_id`.
    async fn update_lock(&self, lock: &MasterLock) -> Result<bool>;

    /// Releases the lease by moving its expiry to `expire_time`.
    ///
    /// Only the current holder can release. Returns false if it no longer
    /// holds the lease.
    async fn unlock(
        &self,
        service_name: &str,
        instance_id: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reads the lease row, valid or not.
    async fn find(&self, service_name: &str) -> Result<Option<MasterLock>>;
}
