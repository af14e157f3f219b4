//! Event and command model shared by the coordinator crates.
//!
//! This crate provides:
//! - Saga and TCC lifecycle events as tagged enums with one data struct per kind
//! - Commands pushed back to participants (compensate, confirm, cancel)
//! - The flat wire message and its conversion into typed events

pub mod command;
pub mod error;
pub mod event;
pub mod status;
pub mod wire;

pub use command::{Ack, Command, CompensateCommand, CoordinateCommand, Coordination};
pub use error::DomainError;
pub use event::{
    AbortedData, DomainEvent, EventData, EventMeta, ParticipatedData, SagaEvent, SagaStartedData,
    TccEndedData, TccEvent, TxStartedData,
};
pub use status::{TransactionStatus, TransactionType};
pub use wire::{InboundEvent, WireTxEvent};
