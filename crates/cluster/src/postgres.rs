use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{LockStore, MasterLock, Result};

/// PostgreSQL-backed lock store over the `master_lock` table.
#[derive(Clone)]
pub struct PostgresLockStore {
    pool: PgPool,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_lock(row: PgRow) -> Result<MasterLock> {
        Ok(MasterLock {
            service_name: row.try_get("service_name")?,
            instance_id: row.try_get("instance_id")?,
            locked_time: row.try_get("locked_time")?,
            expire_time: row.try_get("expire_time")?,
        })
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    async fn init_lock(&self, lock: &MasterLock) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO master_lock (service_name, instance_id, locked_time, expire_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (service_name) DO NOTHING
            "#,
        )
        .bind(&lock.service_name)
        .bind(&lock.instance_id)
        .bind(lock.locked_time)
        .bind(lock.expire_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_lock(&self, lock: &MasterLock) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE master_lock
            SET instance_id = $2, locked_time = $3, expire_time = $4
            WHERE service_name = $1
              AND (expire_time <= $3 OR instance_id = $2)
            "#,
        )
        .bind(&lock.service_name)
        .bind(&lock.instance_id)
        .bind(lock.locked_time)
        .bind(lock.expire_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn unlock(
        &self,
        service_name: &str,
        instance_id: &str,
        expire_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE master_lock SET expire_time = $3 WHERE service_name = $1 AND instance_id = $2",
        )
        .bind(service_name)
        .bind(instance_id)
        .bind(expire_time)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, service_name: &str) -> Result<Option<MasterLock>> {
        let row = sqlx::query(
            r#"
            SELECT service_name, instance_id, locked_time, expire_time
            FROM master_lock
            WHERE service_name = $1
            "#,
        )
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_lock).transpose()
    }
}
