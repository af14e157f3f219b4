//! Publishes the coordinator's reachable address once its listener is up.

use std::collections::HashMap;
use std::sync::RwLock;

/// Metadata key under which the coordinator address is published.
pub const ALPHA_SERVER_ADDRESS_KEY: &str = "servicecomb-alpha-server";

/// Notified once the network listener is bound.
pub trait ListenerStartedListener: Send + Sync {
    fn on_listener_started(&self, port: u16);
}

/// Instance metadata handed to a service-discovery registry.
///
/// An address registered with port 0 (listen on any free port) is completed
/// with the real port when the listener starts.
#[derive(Debug, Default)]
pub struct DiscoveryMetadata {
    metadata: RwLock<HashMap<String, String>>,
}

impl DiscoveryMetadata {
    pub fn new(metadata: HashMap<String, String>) -> Self {
        Self {
            metadata: RwLock::new(metadata),
        }
    }

    /// Metadata carrying `address` under [`ALPHA_SERVER_ADDRESS_KEY`], or
    /// nothing when no address is configured.
    pub fn from_address(address: Option<String>) -> Self {
        let metadata = address
            .map(|a| HashMap::from([(ALPHA_SERVER_ADDRESS_KEY.to_string(), a)]))
            .unwrap_or_default();
        Self::new(metadata)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.metadata.read() {
            Ok(guard) => guard.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    /// The published coordinator address, if any.
    pub fn address(&self) -> Option<String> {
        self.get(ALPHA_SERVER_ADDRESS_KEY)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        match self.metadata.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ListenerStartedListener for DiscoveryMetadata {
    fn on_listener_started(&self, port: u16) {
        let mut metadata = match self.metadata.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(value) = metadata.get_mut(ALPHA_SERVER_ADDRESS_KEY) else {
            return;
        };
        if let Some(host) = value.strip_suffix(":0") {
            *value = format!("{host}:{port}");
            tracing::info!(address = %value, "registered coordinator address in instance metadata");
        }
    }
}
