//! Bounded-retry command delivery.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ServiceConfig;
use domain::{Ack, Command};
use serde::Serialize;

use crate::{CallbackRegistry, DispatchError, Result};

/// Retry settings for command delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5_000),
        }
    }
}

/// How many undeliverable commands are kept by default.
pub const UNDELIVERABLE_CAPACITY: usize = 1024;

/// A command given up on after exhausting its retries.
#[derive(Debug, Clone, Serialize)]
pub struct UndeliverableCommand {
    pub command: Command,
    pub target: ServiceConfig,
    pub attempts: u32,
    /// The error from the final attempt.
    pub last_error: String,
    pub at: DateTime<Utc>,
}

/// Delivers commands to participants through the callback registry.
///
/// The target's channel is looked up again on every attempt, so a
/// participant that reconnects mid-retry receives the command on its new
/// channel.
#[derive(Clone)]
pub struct Dispatcher {
    registry: CallbackRegistry,
    policy: RetryPolicy,
    /// Most recent undeliverable commands, oldest first.
    undeliverable: Arc<Mutex<VecDeque<UndeliverableCommand>>>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(registry: CallbackRegistry, policy: RetryPolicy) -> Self {
        Self {
            registry,
            policy,
            undeliverable: Arc::new(Mutex::new(VecDeque::new())),
            capacity: UNDELIVERABLE_CAPACITY,
        }
    }

    /// Keeps at most `capacity` undeliverable commands; older ones are
    /// dropped first.
    pub fn with_undeliverable_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pushes `command` to its target, retrying with backoff.
    ///
    /// An `aborted` acknowledgment counts as a failed attempt. When every
    /// attempt fails the command is recorded as undeliverable and
    /// `DispatchError::Undeliverable` is returned.
    #[tracing::instrument(skip(self, command), fields(global_tx_id = %command.global_tx_id(), method = %command.method()))]
    pub async fn dispatch(&self, command: Command) -> Result<Ack> {
        let target = command.target();
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = DispatchError::Undeliverable {
            target: target.clone(),
            attempts: 0,
        };

        for attempt in 1..=attempts {
            match self.try_once(&target, command.clone()).await {
                Ok(ack) => {
                    tracing::debug!(attempt, participant = %target, "command acknowledged");
                    return Ok(ack);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "command delivery failed");
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff_for(attempt)).await;
            }
        }

        metrics::counter!("alpha_commands_undeliverable_total").increment(1);
        tracing::warn!(participant = %target, attempts, error = %last_error, "command undeliverable");

        self.record_undeliverable(UndeliverableCommand {
            command,
            target: target.clone(),
            attempts,
            last_error: last_error.to_string(),
            at: Utc::now(),
        });

        Err(DispatchError::Undeliverable { target, attempts })
    }

    async fn try_once(&self, target: &ServiceConfig, command: Command) -> Result<Ack> {
        let callback = self
            .registry
            .retrieve(target)
            .ok_or_else(|| DispatchError::Undeliverable {
                target: target.clone(),
                attempts: 0,
            })?;

        let ack = callback.send(command).await?;
        if ack.aborted {
            return Err(DispatchError::Rejected(target.clone()));
        }
        Ok(ack)
    }

    fn record_undeliverable(&self, entry: UndeliverableCommand) {
        let mut log = match self.undeliverable.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// The most recent commands given up on, oldest first.
    pub fn undeliverable(&self) -> Vec<UndeliverableCommand> {
        match self.undeliverable.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Removes and returns the recorded undeliverable commands.
    pub fn drain_undeliverable(&self) -> Vec<UndeliverableCommand> {
        match self.undeliverable.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }
}
