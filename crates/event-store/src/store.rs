use async_trait::async_trait;
use common::GlobalTxId;

use crate::{EventEnvelope, EventQuery, EventStoreError, Result, TransactionSnapshot, Version};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected current version of the transaction's log.
    /// If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the log to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the transaction to have no events yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Storage port for the transaction event log and transaction summaries.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events of one transaction atomically.
    ///
    /// If `options.expected_version` is set, fails with `ConcurrencyConflict`
    /// when the current version doesn't match. Returns the new version.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// Retrieves all events of a transaction in version order.
    async fn get_events_for_transaction(
        &self,
        global_tx_id: &GlobalTxId,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves a transaction's events starting from a specific version.
    async fn get_events_for_transaction_from_version(
        &self,
        global_tx_id: &GlobalTxId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves events matching a query in insertion order.
    ///
    /// For a single transaction that is version order.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of a transaction's log.
    ///
    /// Returns None if the transaction has no events.
    async fn get_transaction_version(&self, global_tx_id: &GlobalTxId) -> Result<Option<Version>>;

    /// Saves (replaces) the summary of a transaction.
    async fn save_snapshot(&self, snapshot: TransactionSnapshot) -> Result<()>;

    /// Retrieves the summary of a transaction.
    async fn get_snapshot(&self, global_tx_id: &GlobalTxId) -> Result<Option<TransactionSnapshot>>;

    /// Lists transaction summaries, optionally only those in `state`.
    ///
    /// Ordered by last update, oldest first.
    async fn list_snapshots(&self, state: Option<&str>) -> Result<Vec<TransactionSnapshot>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to the store.
    async fn append_event(&self, event: EventEnvelope, options: AppendOptions) -> Result<Version> {
        self.append(vec![event], options).await
    }

    /// Checks if a transaction has any events.
    async fn transaction_exists(&self, global_tx_id: &GlobalTxId) -> Result<bool> {
        Ok(self.get_transaction_version(global_tx_id).await?.is_some())
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a batch before appending.
///
/// The batch must be non-empty, target a single transaction and carry
/// consecutive versions.
pub(crate) fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.global_tx_id != first.global_tx_id {
            return Err(EventStoreError::InvalidAppend(
                "All events must be for the same transaction".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "Event versions must be sequential. Expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
