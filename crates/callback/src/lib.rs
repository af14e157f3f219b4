//! Outbound command path to connected participants.
//!
//! A participant that connects gets an [`OmegaConnection`] to read commands
//! from; the coordinator side keeps the matching [`ChannelCallback`] in the
//! [`CallbackRegistry`]. The [`Dispatcher`] resolves the live channel for a
//! command's target and pushes it with bounded retry.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod registry;

pub use channel::{ChannelCallback, OmegaCallback, OmegaConnection, PendingCommand};
pub use dispatcher::{Dispatcher, RetryPolicy, UndeliverableCommand};
pub use error::{DispatchError, Result};
pub use registry::CallbackRegistry;
