use common::ServiceConfig;
use thiserror::Error;

/// Errors raised while pushing a command to a participant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No live channel for the target after every attempt.
    #[error("Command for {target} undeliverable after {attempts} attempts")]
    Undeliverable {
        target: ServiceConfig,
        attempts: u32,
    },

    /// The participant acknowledged the command as aborted.
    #[error("Participant {0} rejected the command")]
    Rejected(ServiceConfig),

    /// The participant's channel closed before it acknowledged.
    #[error("Channel to {0} is closed")]
    Closed(ServiceConfig),

    /// No acknowledgment within the ack timeout.
    #[error("Timed out waiting for acknowledgment from {0}")]
    Timeout(ServiceConfig),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
