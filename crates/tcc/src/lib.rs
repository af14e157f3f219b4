//! Try-confirm-cancel coordination.
//!
//! Participants register their confirm and cancel methods with a
//! `ParticipatedEvent`. When the initiator ends the transaction, every
//! registered participant is told to confirm (on success) or cancel
//! (otherwise), exactly once per global transaction.

pub mod coordinator;
pub mod error;
pub mod ledger;

pub use coordinator::TccCoordinator;
pub use error::{Result, TccError};
pub use ledger::{ParticipationRecord, TccApplied, TccLedger, TccTransaction};
