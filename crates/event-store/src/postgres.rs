use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::GlobalTxId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, EventId, EventQuery, EventStoreError, Result, TransactionSnapshot, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

const EVENT_COLUMNS: &str =
    "id, event_type, global_tx_id, transaction_type, version, timestamp, payload, metadata";

const SNAPSHOT_COLUMNS: &str = "global_tx_id, transaction_type, state, version, updated_at, summary";

/// PostgreSQL-backed event store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            global_tx_id: GlobalTxId::from(row.try_get::<String, _>("global_tx_id")?),
            transaction_type: row.try_get("transaction_type")?,
            version: Version::new(row.try_get("version")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    fn row_to_snapshot(row: PgRow) -> Result<TransactionSnapshot> {
        Ok(TransactionSnapshot {
            global_tx_id: GlobalTxId::from(row.try_get::<String, _>("global_tx_id")?),
            transaction_type: row.try_get("transaction_type")?,
            state: row.try_get("state")?,
            version: Version::new(row.try_get("version")?),
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            summary: row.try_get("summary")?,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let global_tx_id = events[0].global_tx_id.clone();

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_version {
            let current_version: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM events WHERE global_tx_id = $1")
                    .bind(global_tx_id.as_str())
                    .fetch_one(&mut *tx)
                    .await?;

            let actual = Version::new(current_version.unwrap_or(0));

            if actual != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    global_tx_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last_version = Version::initial();
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, event_type, global_tx_id, transaction_type, version, timestamp, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.global_tx_id.as_str())
            .bind(&event.transaction_type)
            .bind(event.version.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_transaction_version")
                {
                    return EventStoreError::ConcurrencyConflict {
                        global_tx_id: global_tx_id.clone(),
                        expected: options.expected_version.unwrap_or(Version::initial()),
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_version = event.version;
        }

        tx.commit().await?;
        Ok(last_version)
    }

    async fn get_events_for_transaction(
        &self,
        global_tx_id: &GlobalTxId,
    ) -> Result<Vec<EventEnvelope>> {
        self.get_events_for_transaction_from_version(global_tx_id, Version::initial())
            .await
    }

    async fn get_events_for_transaction_from_version(
        &self,
        global_tx_id: &GlobalTxId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE global_tx_id = $1 AND version >= $2 ORDER BY version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(global_tx_id.as_str())
            .bind(from_version.as_i64())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut param_count = 0;

        if query.global_tx_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND global_tx_id = ${param_count}"));
        }
        if query.transaction_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND transaction_type = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version >= ${param_count}"));
        }
        if query.to_version.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND version <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp <= ${param_count}"));
        }

        sql.push_str(" ORDER BY seq ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.global_tx_id {
            sqlx_query = sqlx_query.bind(id.as_str().to_string());
        }
        if let Some(tx_type) = query.transaction_type {
            sqlx_query = sqlx_query.bind(tx_type);
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from_version) = query.from_version {
            sqlx_query = sqlx_query.bind(from_version.as_i64());
        }
        if let Some(to_version) = query.to_version {
            sqlx_query = sqlx_query.bind(to_version.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn get_transaction_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE global_tx_id = $1")
                .bind(global_tx_id.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn save_snapshot(&self, snapshot: TransactionSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transaction_snapshots (global_tx_id, transaction_type, state, version, updated_at, summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (global_tx_id) DO UPDATE SET
                transaction_type = EXCLUDED.transaction_type,
                state = EXCLUDED.state,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at,
                summary = EXCLUDED.summary
            "#,
        )
        .bind(snapshot.global_tx_id.as_str())
        .bind(&snapshot.transaction_type)
        .bind(&snapshot.state)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.updated_at)
        .bind(&snapshot.summary)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<TransactionSnapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM transaction_snapshots WHERE global_tx_id = $1");
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(global_tx_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_snapshot).transpose()
    }

    async fn list_snapshots(&self, state: Option<&str>) -> Result<Vec<TransactionSnapshot>> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM transaction_snapshots WHERE state = $1 ORDER BY updated_at ASC, global_tx_id ASC"
                );
                sqlx::query(&sql).bind(state).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM transaction_snapshots ORDER BY updated_at ASC, global_tx_id ASC"
                );
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };

        rows.into_iter().map(Self::row_to_snapshot).collect()
    }
}
