//! Process-wide map of connected participants.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use common::ServiceConfig;

use crate::OmegaCallback;

/// Maps `(service name, instance id)` to the participant's live channel.
///
/// One entry per participant; a reconnect replaces and closes the previous
/// channel. Clones share the same map.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<HashMap<ServiceConfig, Arc<dyn OmegaCallback>>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `config`, closing any channel it replaces.
    pub fn register(&self, config: ServiceConfig, callback: Arc<dyn OmegaCallback>) {
        let previous = {
            let mut callbacks = match self.callbacks.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let previous = callbacks.insert(config.clone(), callback);
            metrics::gauge!("alpha_connected_omegas").set(callbacks.len() as f64);
            previous
        };

        if let Some(previous) = previous {
            tracing::info!(participant = %config, "participant reconnected, closing previous channel");
            previous.close();
        } else {
            tracing::info!(participant = %config, "participant connected");
        }
    }

    /// Looks up the live channel; None means the participant is unreachable.
    pub fn retrieve(&self, config: &ServiceConfig) -> Option<Arc<dyn OmegaCallback>> {
        let callbacks = match self.callbacks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.get(config).cloned()
    }

    /// Removes and closes the channel for `config`.
    ///
    /// Returns false if nothing was registered.
    pub fn unregister(&self, config: &ServiceConfig) -> bool {
        self.remove_if(config, |_| true)
    }

    /// Removes `callback` only if it is still the live channel for `config`.
    ///
    /// A connection that was replaced by a reconnect must not tear down
    /// its successor.
    pub fn unregister_channel(
        &self,
        config: &ServiceConfig,
        callback: &Arc<dyn OmegaCallback>,
    ) -> bool {
        self.remove_if(config, |live| Arc::ptr_eq(live, callback))
    }

    fn remove_if(
        &self,
        config: &ServiceConfig,
        matches: impl FnOnce(&Arc<dyn OmegaCallback>) -> bool,
    ) -> bool {
        let removed = {
            let mut callbacks = match self.callbacks.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let removed = match callbacks.get(config) {
                Some(live) if matches(live) => callbacks.remove(config),
                _ => None,
            };
            metrics::gauge!("alpha_connected_omegas").set(callbacks.len() as f64);
            removed
        };

        match removed {
            Some(callback) => {
                callback.close();
                tracing::info!(participant = %config, "participant disconnected");
                true
            }
            None => false,
        }
    }

    /// Currently connected participants.
    pub fn connected(&self) -> Vec<ServiceConfig> {
        let callbacks = match self.callbacks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut connected: Vec<_> = callbacks.keys().cloned().collect();
        connected.sort_by(|a, b| {
            a.service_name
                .cmp(&b.service_name)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        connected
    }

    pub fn len(&self) -> usize {
        match self.callbacks.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
