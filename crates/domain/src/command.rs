//! Commands the coordinator pushes back to participants.

use common::{GlobalTxId, LocalTxId, ServiceConfig};
use serde::{Deserialize, Serialize};

/// Asks a saga participant to undo a committed local transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensateCommand {
    pub global_tx_id: GlobalTxId,
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: String,
    pub instance_id: String,
    pub compensation_method: String,
    pub payloads: Vec<u8>,
}

/// Which phase-two method a TCC participant must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coordination {
    Confirm,
    Cancel,
}

impl Coordination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coordination::Confirm => "confirm",
            Coordination::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for Coordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Asks a TCC participant to confirm or cancel its reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateCommand {
    pub global_tx_id: GlobalTxId,
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: String,
    pub instance_id: String,
    pub coordination: Coordination,
    /// The resolved confirm or cancel method name.
    pub method: String,
}

/// Any command sent over a participant's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Compensate(CompensateCommand),
    Coordinate(CoordinateCommand),
}

impl Command {
    pub fn global_tx_id(&self) -> &GlobalTxId {
        match self {
            Command::Compensate(cmd) => &cmd.global_tx_id,
            Command::Coordinate(cmd) => &cmd.global_tx_id,
        }
    }

    pub fn local_tx_id(&self) -> &LocalTxId {
        match self {
            Command::Compensate(cmd) => &cmd.local_tx_id,
            Command::Coordinate(cmd) => &cmd.local_tx_id,
        }
    }

    /// Name of the method the participant is asked to run.
    pub fn method(&self) -> &str {
        match self {
            Command::Compensate(cmd) => &cmd.compensation_method,
            Command::Coordinate(cmd) => &cmd.method,
        }
    }

    /// The participant instance the command is addressed to.
    pub fn target(&self) -> ServiceConfig {
        match self {
            Command::Compensate(cmd) => ServiceConfig::new(&cmd.service_name, &cmd.instance_id),
            Command::Coordinate(cmd) => ServiceConfig::new(&cmd.service_name, &cmd.instance_id),
        }
    }
}

impl From<CompensateCommand> for Command {
    fn from(cmd: CompensateCommand) -> Self {
        Command::Compensate(cmd)
    }
}

impl From<CoordinateCommand> for Command {
    fn from(cmd: CoordinateCommand) -> Self {
        Command::Coordinate(cmd)
    }
}

/// Participant's reply to a pushed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ack {
    /// True when the participant rejected or failed to run the command.
    pub aborted: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { aborted: false }
    }

    pub fn aborted() -> Self {
        Self { aborted: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinate(method: &str) -> Command {
        Command::Coordinate(CoordinateCommand {
            global_tx_id: "g2".into(),
            local_tx_id: "l1".into(),
            parent_tx_id: None,
            service_name: "inventory".to_string(),
            instance_id: "inventory-1".to_string(),
            coordination: Coordination::Cancel,
            method: method.to_string(),
        })
    }

    #[test]
    fn test_method_and_target() {
        let cmd = coordinate("x");
        assert_eq!(cmd.method(), "x");
        assert_eq!(cmd.target(), ServiceConfig::new("inventory", "inventory-1"));
        assert_eq!(cmd.global_tx_id().as_str(), "g2");
    }

    #[test]
    fn test_command_serialization_is_tagged() {
        let json = serde_json::to_value(coordinate("x")).unwrap();
        assert_eq!(json["kind"], "coordinate");
        assert_eq!(json["coordination"], "Cancel");
    }

    #[test]
    fn test_ack_defaults_to_not_aborted() {
        assert_eq!(Ack::default(), Ack::ok());
        assert!(Ack::aborted().aborted);
    }
}
