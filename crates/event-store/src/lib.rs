//! Append-only audit log of transaction lifecycle events.
//!
//! Every event a coordinator receives is stored as an [`EventEnvelope`]
//! keyed by its global transaction id, with a per-transaction [`Version`].
//! A [`TransactionSnapshot`] per transaction keeps the latest summary so
//! that any instance can answer state queries without replaying.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod snapshot;
pub mod store;

pub use common::GlobalTxId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::EventQuery;
pub use snapshot::TransactionSnapshot;
pub use store::{AppendOptions, EventStore, EventStoreExt};
