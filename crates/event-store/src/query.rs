use chrono::{DateTime, Utc};
use common::GlobalTxId;

use crate::Version;

/// Filter for reading events from the log.
///
/// Every field is optional; unset fields do not restrict the result.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub global_tx_id: Option<GlobalTxId>,

    /// "SAGA" or "TCC".
    pub transaction_type: Option<String>,

    /// Any of these event types.
    pub event_types: Option<Vec<String>>,

    /// Minimum version (inclusive).
    pub from_version: Option<Version>,

    /// Maximum version (inclusive).
    pub to_version: Option<Version>,

    /// Events recorded at or after this instant.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Events recorded at or before this instant.
    pub to_timestamp: Option<DateTime<Utc>>,

    pub limit: Option<usize>,

    pub offset: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for one global transaction.
    pub fn for_transaction(global_tx_id: GlobalTxId) -> Self {
        Self {
            global_tx_id: Some(global_tx_id),
            ..Default::default()
        }
    }

    /// Creates a query for events of a specific type.
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_types: Some(vec![event_type.into()]),
            ..Default::default()
        }
    }

    pub fn global_tx_id(mut self, id: GlobalTxId) -> Self {
        self.global_tx_id = Some(id);
        self
    }

    pub fn transaction_type(mut self, transaction_type: impl Into<String>) -> Self {
        self.transaction_type = Some(transaction_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn from_version(mut self, version: Version) -> Self {
        self.from_version = Some(version);
        self
    }

    pub fn to_version(mut self, version: Version) -> Self {
        self.to_version = Some(version);
        self
    }

    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_for_transaction() {
        let query = EventQuery::for_transaction(GlobalTxId::from("g1"));

        assert_eq!(query.global_tx_id, Some(GlobalTxId::from("g1")));
        assert!(query.event_types.is_none());
    }

    #[test]
    fn query_builder_chain() {
        let query = EventQuery::new()
            .transaction_type("TCC")
            .event_types(vec![
                "ParticipatedEvent".to_string(),
                "TccTransactionEndedEvent".to_string(),
            ])
            .from_version(Version::new(2))
            .limit(10)
            .offset(5);

        assert_eq!(query.transaction_type.as_deref(), Some("TCC"));
        assert_eq!(query.event_types.as_ref().map(Vec::len), Some(2));
        assert_eq!(query.from_version, Some(Version::new(2)));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
    }
}
