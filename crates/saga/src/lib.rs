//! Saga global transaction coordination.
//!
//! This crate provides:
//! - [`GlobalTransaction`], the per-transaction state machine that turns
//!   lifecycle events into state changes and compensation commands
//! - [`SagaCoordinator`], which serializes events per transaction, writes
//!   them to the audit log and dispatches compensations
//!
//! When a sub-transaction aborts, every sub-transaction that already
//! succeeded is compensated in reverse order of completion.

pub mod coordinator;
pub mod error;
pub mod state;
pub mod transaction;

pub use coordinator::{SagaConfig, SagaCoordinator};
pub use error::{Result, SagaError};
pub use state::SagaState;
pub use transaction::{
    Applied, CompensationStatus, EventOutcome, GlobalTransaction, RecordedEvent, SubTransaction,
};
