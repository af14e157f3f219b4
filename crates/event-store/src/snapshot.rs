use chrono::{DateTime, Utc};
use common::GlobalTxId;
use serde::{Deserialize, Serialize};

use crate::Version;

/// Latest summary of one global transaction.
///
/// Written after every applied event so that state queries (for example
/// "all SUSPENDED sagas") do not need to replay the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub global_tx_id: GlobalTxId,

    /// "SAGA" or "TCC".
    pub transaction_type: String,

    /// State name at the time of the snapshot (e.g. "COMMITTED").
    pub state: String,

    /// Log version the summary reflects.
    pub version: Version,

    pub updated_at: DateTime<Utc>,

    /// The serialized transaction.
    pub summary: serde_json::Value,
}

impl TransactionSnapshot {
    /// Creates a snapshot from a serializable transaction summary.
    pub fn from_state<T: Serialize>(
        global_tx_id: GlobalTxId,
        transaction_type: impl Into<String>,
        state: impl Into<String>,
        version: Version,
        summary: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            global_tx_id,
            transaction_type: transaction_type.into(),
            state: state.into(),
            version,
            updated_at: Utc::now(),
            summary: serde_json::to_value(summary)?,
        })
    }

    /// Deserializes the summary into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.summary)
    }
}
