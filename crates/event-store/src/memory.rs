use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::GlobalTxId;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventQuery, EventStoreError, Result, TransactionSnapshot, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// In-memory event store.
///
/// Used when no database is configured and in tests. Provides the same
/// interface as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
    snapshots: Arc<RwLock<HashMap<GlobalTxId, TransactionSnapshot>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

fn current_version(events: &[EventEnvelope], global_tx_id: &GlobalTxId) -> Version {
    events
        .iter()
        .filter(|e| &e.global_tx_id == global_tx_id)
        .map(|e| e.version)
        .max()
        .unwrap_or(Version::initial())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let first_event = &events[0];
        let global_tx_id = first_event.global_tx_id.clone();

        let mut store = self.events.write().await;
        let current = current_version(&store, &global_tx_id);

        if let Some(expected) = options.expected_version
            && current != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                global_tx_id,
                expected,
                actual: current,
            });
        }

        // Unique (transaction, version) constraint
        if first_event.version <= current {
            return Err(EventStoreError::ConcurrencyConflict {
                global_tx_id,
                expected: options.expected_version.unwrap_or(current),
                actual: current,
            });
        }

        let last_version = events.last().map(|e| e.version).unwrap_or(current);
        store.extend(events);

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
        let store = self.events.read().await;
        let mut events: Vec<_> = store
            .iter()
            .filter(|e| &e.global_tx_id == global_tx_id && e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let store = self.events.read().await;
        let events = store
            .iter()
            .filter(|e| {
                if let Some(ref id) = query.global_tx_id
                    && &e.global_tx_id != id
                {
                    return false;
                }
                if let Some(ref tx_type) = query.transaction_type
                    && &e.transaction_type != tx_type
                {
                    return false;
                }
                if let Some(ref types) = query.event_types
                    && !types.contains(&e.event_type)
                {
                    return false;
                }
                if let Some(from) = query.from_version
                    && e.version < from
                {
                    return false;
                }
                if let Some(to) = query.to_version
                    && e.version > to
                {
                    return false;
                }
                if let Some(from) = query.from_timestamp
                    && e.timestamp < from
                {
                    return false;
                }
                if let Some(to) = query.to_timestamp
                    && e.timestamp > to
                {
                    return false;
                }
                true
            })
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(events)
    }

    async fn get_transaction_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>> {
        let store = self.events.read().await;
        let version = store
            .iter()
            .filter(|e| &e.global_tx_id == global_tx_id)
            .map(|e| e.version)
            .max();
        Ok(version)
    }

    async fn save_snapshot(&self, snapshot: TransactionSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.global_tx_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<TransactionSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(global_tx_id).cloned())
    }

    async fn list_snapshots(&self, state: Option<&str>) -> Result<Vec<TransactionSnapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut result: Vec<_> = snapshots
            .values()
            .filter(|s| state.is_none_or(|state| s.state == state))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.global_tx_id.cmp(&b.global_tx_id))
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event(gid: &str, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .global_tx_id(GlobalTxId::from(gid))
            .transaction_type("SAGA")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"test": true}))
            .try_build()
            .unwrap()
    }

    fn snapshot(gid: &str, state: &str) -> TransactionSnapshot {
        TransactionSnapshot::from_state(
            GlobalTxId::from(gid),
            "SAGA",
            state,
            Version::first(),
            &serde_json::json!({"state": state}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let event = create_test_event("g1", 1, "SagaStartedEvent");

        let result = store.append(vec![event], AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), Version::first());

        let gid = GlobalTxId::from("g1");
        let events = store.get_events_for_transaction(&gid).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();

        let events = vec![
            create_test_event("g1", 1, "SagaStartedEvent"),
            create_test_event("g1", 2, "TxStartedEvent"),
            create_test_event("g1", 3, "TxEndedEvent"),
        ];

        let result = store.append(events, AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), Version::new(3));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_wrong_version() {
        let store = InMemoryEventStore::new();
        store
            .append(
                vec![create_test_event("g1", 1, "SagaStartedEvent")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![create_test_event("g1", 2, "TxStartedEvent")],
                AppendOptions::expect_version(Version::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected_without_expectation() {
        let store = InMemoryEventStore::new();
        store
            .append(
                vec![create_test_event("g1", 1, "SagaStartedEvent")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![create_test_event("g1", 1, "SagaStartedEvent")],
                AppendOptions::new(),
            )
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn transactions_are_versioned_independently() {
        let store = InMemoryEventStore::new();
        store
            .append(
                vec![create_test_event("g1", 1, "SagaStartedEvent")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        store
            .append(
                vec![create_test_event("g2", 1, "SagaStartedEvent")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let version = store
            .get_transaction_version(&GlobalTxId::from("g2"))
            .await
            .unwrap();
        assert_eq!(version, Some(Version::first()));
        let missing = store
            .get_transaction_version(&GlobalTxId::from("g3"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn get_events_from_version() {
        let store = InMemoryEventStore::new();
        let events = vec![
            create_test_event("g1", 1, "SagaStartedEvent"),
            create_test_event("g1", 2, "TxStartedEvent"),
            create_test_event("g1", 3, "TxEndedEvent"),
        ];
        store.append(events, AppendOptions::new()).await.unwrap();

        let from_v2 = store
            .get_events_for_transaction_from_version(&GlobalTxId::from("g1"), Version::new(2))
            .await
            .unwrap();
        assert_eq!(from_v2.len(), 2);
        assert_eq!(from_v2[0].version, Version::new(2));
        assert_eq!(from_v2[1].version, Version::new(3));
    }

    #[tokio::test]
    async fn query_by_type_with_limit() {
        let store = InMemoryEventStore::new();
        for gid in ["g1", "g2", "g3"] {
            store
                .append(
                    vec![
                        create_test_event(gid, 1, "SagaStartedEvent"),
                        create_test_event(gid, 2, "SagaEndedEvent"),
                    ],
                    AppendOptions::new(),
                )
                .await
                .unwrap();
        }

        let ended = store
            .query_events(EventQuery::for_event_type("SagaEndedEvent"))
            .await
            .unwrap();
        assert_eq!(ended.len(), 3);

        let page = store
            .query_events(EventQuery::for_event_type("SagaStartedEvent").limit(2).offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_upsert_and_list_by_state() {
        let store = InMemoryEventStore::new();
        store.save_snapshot(snapshot("g1", "COMMITTING")).await.unwrap();
        store.save_snapshot(snapshot("g2", "SUSPENDED")).await.unwrap();
        store.save_snapshot(snapshot("g1", "COMMITTED")).await.unwrap();

        let g1 = store
            .get_snapshot(&GlobalTxId::from("g1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(g1.state, "COMMITTED");

        let suspended = store.list_snapshots(Some("SUSPENDED")).await.unwrap();
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].global_tx_id.as_str(), "g2");

        let all = store.list_snapshots(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_not_found() {
        let store = InMemoryEventStore::new();
        let result = store.get_snapshot(&GlobalTxId::from("g9")).await.unwrap();
        assert!(result.is_none());
    }
}
