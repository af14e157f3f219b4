//! One participant's outbound command channel.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use common::ServiceConfig;
use domain::{Ack, Command};
use tokio::sync::{mpsc, oneshot};

use crate::{DispatchError, Result};

/// Pushes commands to one connected participant.
#[async_trait]
pub trait OmegaCallback: Send + Sync {
    /// Sends a command and waits for the participant's acknowledgment.
    ///
    /// Queueing and acknowledgment together are bounded by the ack timeout,
    /// so a participant that stops reading fails the send with `Timeout`.
    async fn send(&self, command: Command) -> Result<Ack>;

    /// Closes the channel; later sends fail with `Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A command waiting for the participant to run it.
#[derive(Debug)]
pub struct PendingCommand {
    command: Command,
    reply: oneshot::Sender<Ack>,
}

impl PendingCommand {
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Reports the outcome back to the dispatcher.
    pub fn ack(self, ack: Ack) {
        // The dispatcher may have timed out and gone away.
        let _ = self.reply.send(ack);
    }

    /// True once the dispatcher stopped waiting for this command.
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Participant end of a channel: yields commands addressed to it.
#[derive(Debug)]
pub struct OmegaConnection {
    target: ServiceConfig,
    rx: mpsc::Receiver<PendingCommand>,
}

impl OmegaConnection {
    pub fn target(&self) -> &ServiceConfig {
        &self.target
    }

    /// Receives the next command, or None once the coordinator closed the
    /// channel.
    pub async fn recv(&mut self) -> Option<PendingCommand> {
        self.rx.recv().await
    }
}

/// Coordinator end of a participant channel over a tokio mpsc queue.
#[derive(Debug)]
pub struct ChannelCallback {
    target: ServiceConfig,
    tx: Mutex<Option<mpsc::Sender<PendingCommand>>>,
    ack_timeout: Duration,
}

impl ChannelCallback {
    /// Creates a connected pair for `target`.
    pub fn channel(
        target: ServiceConfig,
        buffer: usize,
        ack_timeout: Duration,
    ) -> (Self, OmegaConnection) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let callback = Self {
            target: target.clone(),
            tx: Mutex::new(Some(tx)),
            ack_timeout,
        };
        (callback, OmegaConnection { target, rx })
    }

    pub fn target(&self) -> &ServiceConfig {
        &self.target
    }

    fn sender(&self) -> Option<mpsc::Sender<PendingCommand>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl OmegaCallback for ChannelCallback {
    async fn send(&self, command: Command) -> Result<Ack> {
        let tx = self
            .sender()
            .ok_or_else(|| DispatchError::Closed(self.target.clone()))?;

        let (reply, ack_rx) = oneshot::channel();
        let push = async {
            tx.send(PendingCommand { command, reply })
                .await
                .map_err(|_| DispatchError::Closed(self.target.clone()))?;
            ack_rx
                .await
                .map_err(|_| DispatchError::Closed(self.target.clone()))
        };

        tokio::time::timeout(self.ack_timeout, push)
            .await
            .map_err(|_| DispatchError::Timeout(self.target.clone()))?
    }

    fn close(&self) {
        let taken = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if taken.is_some() {
            tracing::debug!(participant = %self.target, "participant channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.sender().is_none_or(|tx| tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use domain::{CoordinateCommand, Coordination};

    use super::*;

    fn command() -> Command {
        Command::Coordinate(CoordinateCommand {
            global_tx_id: "g2".into(),
            local_tx_id: "l1".into(),
            parent_tx_id: None,
            service_name: "inventory".to_string(),
            instance_id: "inventory-1".to_string(),
            coordination: Coordination::Confirm,
            method: "c".to_string(),
        })
    }

    fn pair(timeout: Duration) -> (ChannelCallback, OmegaConnection) {
        ChannelCallback::channel(ServiceConfig::new("inventory", "inventory-1"), 8, timeout)
    }

    #[tokio::test]
    async fn send_returns_participant_ack() {
        let (callback, mut connection) = pair(Duration::from_secs(1));

        let participant = tokio::spawn(async move {
            let pending = connection.recv().await.unwrap();
            let method = pending.command().method().to_string();
            pending.ack(Ack::ok());
            method
        });

        let ack = callback.send(command()).await.unwrap();
        assert_eq!(ack, Ack::ok());
        assert_eq!(participant.await.unwrap(), "c");
    }

    #[tokio::test]
    async fn dropped_command_reports_closed() {
        let (callback, mut connection) = pair(Duration::from_secs(1));

        tokio::spawn(async move {
            let pending = connection.recv().await.unwrap();
            drop(pending);
        });

        let result = callback.send(command()).await;
        assert!(matches!(result, Err(DispatchError::Closed(_))));
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let (callback, _connection) = pair(Duration::from_millis(20));

        let result = callback.send(command()).await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let (callback, _connection) = ChannelCallback::channel(
            ServiceConfig::new("inventory", "inventory-1"),
            1,
            Duration::from_millis(50),
        );

        // The first command fills the queue and is never acknowledged.
        assert!(matches!(
            callback.send(command()).await,
            Err(DispatchError::Timeout(_))
        ));

        let second = tokio::time::timeout(Duration::from_secs(2), callback.send(command()))
            .await
            .expect("send blocked on a full queue");
        assert!(matches!(second, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn close_ends_participant_stream() {
        let (callback, mut connection) = pair(Duration::from_secs(1));

        callback.close();

        assert!(callback.is_closed());
        assert!(connection.recv().await.is_none());
        assert!(matches!(
            callback.send(command()).await,
            Err(DispatchError::Closed(_))
        ));
    }
}
