//! Global transaction state machine states.

use serde::{Deserialize, Serialize};

/// The state of a saga global transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Idle ──► Committing ──┬──► Committed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► Suspended
/// ```
///
/// `Committing` may also move straight to `Suspended` when the saga times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// No start event seen yet.
    #[default]
    Idle,

    /// Sub-transactions are being reported.
    Committing,

    /// Every sub-transaction succeeded (terminal state).
    Committed,

    /// A sub-transaction failed and compensations are outstanding.
    Compensating,

    /// Every compensation was acknowledged (terminal state).
    Compensated,

    /// Compensation could not be completed; needs an operator (terminal state).
    Suspended,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Committed | SagaState::Compensated | SagaState::Suspended
        )
    }

    /// Returns the state name as stored in transaction snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Idle => "IDLE",
            SagaState::Committing => "COMMITTING",
            SagaState::Committed => "COMMITTED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Compensated => "COMPENSATED",
            SagaState::Suspended => "SUSPENDED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
