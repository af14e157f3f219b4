use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{LockStore, MasterLock, Result};

/// In-memory lock store.
///
/// Shares the lease between elections in one process; used when no
/// database is configured and in tests.
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    locks: Arc<RwLock<HashMap<String, MasterLock>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn init_lock(&self, lock: &MasterLock) -> Result<bool> {
        let mut locks = self.locks.write().await;
        if locks.contains_key(&lock.service_name) {
            return Ok(false);
        }
        locks.insert(lock.service_name.clone(), lock.clone());
        Ok(true)
    }

    async fn update_lock(&self, lock: &MasterLock) -> Result<bool> {
        let mut locks = self.locks.write().await;
        let Some(current) = locks.get_mut(&lock.service_name) else {
            return Ok(false);
        };

        // Same predicate as the SQL conditional update.
        if current.expire_time <= lock.locked_time || current.is_held_by(&lock.instance_id) {
            *current = lock.clone();
            return Ok(true);
        }
        Ok(false)
    }

    async fn unlock(
        &self,
        service_name: &str,
        instance_id: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut locks = self.locks.write().await;
        match locks.get_mut(service_name) {
            Some(current) if current.is_held_by(instance_id) => {
                current.expire_time = expire_time;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, service_name: &str) -> Result<Option<MasterLock>> {
        Ok(self.locks.read().await.get(service_name).cloned())
    }
}
