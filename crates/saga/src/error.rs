//! Saga error types.

use common::{GlobalTxId, LocalTxId};
use event_store::EventStoreError;
use thiserror::Error;

use crate::state::SagaState;

/// Errors that can occur while coordinating sagas.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The event belongs to a global transaction that was never started.
    #[error("Orphan {event_type} for unknown transaction {global_tx_id}")]
    OrphanEvent {
        global_tx_id: GlobalTxId,
        event_type: &'static str,
    },

    /// The event is causally out of order for its transaction.
    #[error("Illegal {event_type} for {global_tx_id}/{local_tx_id} in state {state}: {reason}")]
    IllegalTransition {
        global_tx_id: GlobalTxId,
        local_tx_id: LocalTxId,
        event_type: &'static str,
        state: SagaState,
        reason: &'static str,
    },

    /// This instance does not hold the cluster lease.
    #[error("Coordinator is on standby")]
    NotActive,

    /// Event store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
