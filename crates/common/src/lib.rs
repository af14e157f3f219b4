//! Shared identifier types for the coordinator crates.

pub mod types;

pub use types::{GlobalTxId, LocalTxId, ServiceConfig};
