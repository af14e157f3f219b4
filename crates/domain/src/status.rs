//! Sub-transaction status and transaction type.

use serde::{Deserialize, Serialize};

/// Outcome of one participant's local transaction.
///
/// Moves monotonically from `Unknown` to `Succeed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransactionStatus {
    Succeed,
    Failed,
    #[default]
    Unknown,
}

impl TransactionStatus {
    /// Parses a status string received from a participant.
    ///
    /// Anything other than the three known literals is read as `Failed`, so an
    /// unrecognised status leads to cancellation rather than confirmation.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "Succeed" => TransactionStatus::Succeed,
            "Failed" => TransactionStatus::Failed,
            "Unknown" => TransactionStatus::Unknown,
            _ => TransactionStatus::Failed,
        }
    }

    /// Returns true once the status can no longer change.
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Succeed => "Succeed",
            TransactionStatus::Failed => "Failed",
            TransactionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Distributed transaction pattern a global transaction follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Saga,
    Tcc,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Saga => "SAGA",
            TransactionType::Tcc => "TCC",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
