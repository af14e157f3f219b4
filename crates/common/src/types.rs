use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a global (distributed) transaction.
///
/// Participants choose the id, so it is carried as an opaque string. Wrapping
/// it keeps global and local transaction ids from being mixed up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalTxId(String);

impl GlobalTxId {
    /// Creates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GlobalTxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GlobalTxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GlobalTxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for GlobalTxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of one participant's leg inside a global transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalTxId(String);

impl LocalTxId {
    /// Creates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LocalTxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalTxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for LocalTxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for LocalTxId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identity of a connected participant (omega) instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,
    pub instance_id: String,
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service_name, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_tx_id_new_creates_unique_ids() {
        let id1 = GlobalTxId::new();
        let id2 = GlobalTxId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = GlobalTxId::from("g1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"g1\"");

        let local: LocalTxId = serde_json::from_str("\"l1\"").unwrap();
        assert_eq!(local.as_str(), "l1");
    }

    #[test]
    fn service_config_display() {
        let config = ServiceConfig::new("order-service", "order-1");
        assert_eq!(config.to_string(), "order-service/order-1");
    }
}
