//! Cluster leadership for coordinator instances.
//!
//! A single lease row per service name decides which instance may mutate
//! transaction state and dispatch commands. [`LeaderElection`] acquires and
//! renews the lease; callers consult the [`LeaderGate`] it hands out.

pub mod election;
pub mod error;
pub mod lock;
pub mod memory;
pub mod postgres;

pub use election::{ElectionConfig, LeaderElection, LeaderGate};
pub use error::{ClusterError, Result};
pub use lock::{LockStore, MasterLock};
pub use memory::InMemoryLockStore;
pub use postgres::PostgresLockStore;
