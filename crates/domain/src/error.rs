//! Domain error types.

use thiserror::Error;

/// Errors raised while turning inbound messages into domain events.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The message `type` is not one of the known lifecycle events.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A field the event kind requires was empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The timestamp could not be represented.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for domain results.
pub type Result<T> = std::result::Result<T, DomainError>;
