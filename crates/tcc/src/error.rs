//! TCC error types.

use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur while coordinating TCC transactions.
#[derive(Debug, Error)]
pub enum TccError {
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

/// Convenience type alias for TCC results.
pub type Result<T> = std::result::Result<T, TccError>;
