use thiserror::Error;

/// Errors raised by the lock store.
///
/// Losing a lease race is not an error; operations report it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The lock table could not be read or written.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A lock store call did not finish in time.
    #[error("Lock store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
