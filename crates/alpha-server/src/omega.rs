//! Participant-facing service: connection lifecycle and event ingestion.
//!
//! Transport-agnostic; the HTTP ingest route and any streaming transport
//! call the same methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use callback::{CallbackRegistry, ChannelCallback, OmegaCallback, OmegaConnection, PendingCommand};
use common::{GlobalTxId, LocalTxId, ServiceConfig};
use domain::{Ack, Command, InboundEvent, SagaEvent, WireTxEvent};
use saga::{SagaCoordinator, SagaState};
use tcc::TccCoordinator;

use crate::error::ApiError;

/// Commands queued per participant before pushes wait for room.
const COMMAND_BUFFER: usize = 64;

type InflightKey = (ServiceConfig, GlobalTxId, LocalTxId);

/// Streamed commands waiting for an out-of-band ack.
#[derive(Clone, Default)]
struct Inflight(Arc<StdMutex<HashMap<InflightKey, PendingCommand>>>);

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, HashMap<InflightKey, PendingCommand>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Dropping a pending command fails its delivery attempt.
    fn forget(&self, config: &ServiceConfig) {
        self.lock().retain(|(target, _, _), _| target != config);
    }
}

/// Entry point for connected participants.
#[derive(Clone)]
pub struct OmegaService {
    registry: CallbackRegistry,
    saga: SagaCoordinator,
    tcc: TccCoordinator,
    ack_timeout: Duration,
    inflight: Inflight,
}

impl OmegaService {
    pub fn new(
        registry: CallbackRegistry,
        saga: SagaCoordinator,
        tcc: TccCoordinator,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            saga,
            tcc,
            ack_timeout,
            inflight: Inflight::default(),
        }
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    pub fn saga(&self) -> &SagaCoordinator {
        &self.saga
    }

    pub fn tcc(&self) -> &TccCoordinator {
        &self.tcc
    }

    /// Opens the command channel for a participant.
    ///
    /// The returned connection yields the commands addressed to it. A
    /// reconnect replaces and closes the previous channel.
    pub fn on_connected(&self, config: ServiceConfig) -> OmegaConnection {
        self.connect(config).1
    }

    /// Opens a command stream for a participant that acks separately.
    ///
    /// Each command the stream yields waits for [`Self::ack_command`].
    /// Dropping the stream disconnects the participant unless it has
    /// reconnected since.
    pub fn open_stream(&self, config: ServiceConfig) -> CommandStream {
        let (callback, connection) = self.connect(config);
        CommandStream {
            service: self.clone(),
            connection,
            callback,
        }
    }

    /// Drops a participant's command channel. Returns false if it was not
    /// connected.
    pub fn on_disconnected(&self, config: &ServiceConfig) -> bool {
        self.inflight.forget(config);
        self.registry.unregister(config)
    }

    /// Reports the outcome of a streamed command.
    ///
    /// Returns false when no such command is waiting, e.g. because the
    /// dispatcher already gave up on it.
    pub fn ack_command(
        &self,
        config: &ServiceConfig,
        global_tx_id: &GlobalTxId,
        local_tx_id: &LocalTxId,
        ack: Ack,
    ) -> bool {
        let key = (config.clone(), global_tx_id.clone(), local_tx_id.clone());
        let Some(pending) = self.inflight.lock().remove(&key) else {
            return false;
        };
        if pending.is_abandoned() {
            return false;
        }
        pending.ack(ack);
        true
    }

    fn connect(&self, config: ServiceConfig) -> (Arc<dyn OmegaCallback>, OmegaConnection) {
        let (callback, connection) =
            ChannelCallback::channel(config.clone(), COMMAND_BUFFER, self.ack_timeout);
        let callback: Arc<dyn OmegaCallback> = Arc::new(callback);
        self.registry.register(config, callback.clone());
        (callback, connection)
    }

    /// Routes one inbound message to the saga or TCC coordinator.
    ///
    /// The ack is `aborted` when a participant starts a sub-transaction in a
    /// saga that is no longer committing, so it can stop early.
    #[tracing::instrument(
        skip(self, wire),
        fields(global_tx_id = %wire.global_tx_id, event_type = %wire.event_type)
    )]
    pub async fn on_tx_event(&self, wire: WireTxEvent) -> Result<Ack, ApiError> {
        let inbound = InboundEvent::try_from(wire).inspect_err(|_| {
            metrics::counter!("alpha_events_rejected_total").increment(1);
        })?;
        match inbound {
            InboundEvent::Saga(event) => {
                let starts_sub = matches!(event, SagaEvent::TxStartedEvent(_));
                let applied = self.saga.on_event(event).await?;
                if starts_sub && applied.state != SagaState::Committing {
                    tracing::debug!(state = %applied.state, "sub-transaction started in finished saga");
                    metrics::counter!("alpha_acks_aborted_total").increment(1);
                    return Ok(Ack::aborted());
                }
                Ok(Ack::ok())
            }
            InboundEvent::Tcc(event) => {
                self.tcc.on_event(event).await?;
                Ok(Ack::ok())
            }
        }
    }

    /// Rebuilds coordinator state after this instance became active.
    ///
    /// Cached state may predate another instance's tenure, so it is dropped
    /// and in-flight sagas are reloaded from storage. Returns how many were
    /// recovered.
    pub async fn on_leadership_gained(&self) -> Result<usize, ApiError> {
        self.saga.reset();
        self.tcc.reset().await;
        let recovered = self.saga.recover_in_flight().await?;
        tracing::info!(recovered, "coordinator state rebuilt");
        Ok(recovered)
    }
}

/// Commands for one participant, acked through [`OmegaService::ack_command`].
pub struct CommandStream {
    service: OmegaService,
    connection: OmegaConnection,
    callback: Arc<dyn OmegaCallback>,
}

impl CommandStream {
    pub fn target(&self) -> &ServiceConfig {
        self.connection.target()
    }

    /// Waits for the next command, or None once the channel is closed.
    pub async fn next(&mut self) -> Option<Command> {
        let pending = self.connection.recv().await?;
        let command = pending.command().clone();
        let key = (
            self.target().clone(),
            command.global_tx_id().clone(),
            command.local_tx_id().clone(),
        );

        let mut inflight = self.service.inflight.lock();
        inflight.retain(|_, waiting| !waiting.is_abandoned());
        inflight.insert(key, pending);
        Some(command)
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        let target = self.connection.target().clone();
        if self
            .service
            .registry
            .unregister_channel(&target, &self.callback)
        {
            self.service.inflight.forget(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use callback::{Dispatcher, RetryPolicy};
    use cluster::LeaderGate;
    use domain::Command;
    use event_store::{EventStore, InMemoryEventStore};
    use saga::SagaConfig;

    use super::*;

    fn service(store: &InMemoryEventStore) -> OmegaService {
        let registry = CallbackRegistry::new();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
            },
        );
        let store: Arc<dyn EventStore> = Arc::new(store.clone());
        OmegaService::new(
            registry,
            SagaCoordinator::new(
                store.clone(),
                dispatcher.clone(),
                LeaderGate::always_active(),
                SagaConfig::default(),
            ),
            TccCoordinator::new(store, dispatcher, LeaderGate::always_active()),
            Duration::from_secs(1),
        )
    }

    fn wire(event_type: &str, local: &str) -> WireTxEvent {
        WireTxEvent {
            service_name: "booking".to_string(),
            instance_id: "booking-1".to_string(),
            global_tx_id: "g1".to_string(),
            local_tx_id: local.to_string(),
            parent_tx_id: "g1".to_string(),
            event_type: event_type.to_string(),
            compensation_method: format!("cancel_{local}"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let omega = service(&InMemoryEventStore::new());
        let config = ServiceConfig::new("booking", "booking-1");

        let connection = omega.on_connected(config.clone());
        assert_eq!(connection.target(), &config);
        assert_eq!(omega.registry().len(), 1);

        assert!(omega.on_disconnected(&config));
        assert!(!omega.on_disconnected(&config));
        assert!(omega.registry().is_empty());
    }

    #[tokio::test]
    async fn test_sub_transaction_after_abort_is_refused() {
        let omega = service(&InMemoryEventStore::new());
        let mut connection = omega.on_connected(ServiceConfig::new("booking", "booking-1"));

        for (event_type, local) in [
            ("SagaStartedEvent", ""),
            ("TxStartedEvent", "l1"),
            ("TxEndedEvent", "l1"),
            ("TxStartedEvent", "l2"),
            ("TxAbortedEvent", "l2"),
        ] {
            let ack = omega.on_tx_event(wire(event_type, local)).await.unwrap();
            assert!(!ack.aborted, "{event_type} should be accepted");
        }

        let pending = tokio::time::timeout(Duration::from_secs(2), connection.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(pending.command(), Command::Compensate(c) if c.compensation_method == "cancel_l1"));
        pending.ack(Ack::ok());

        let ack = omega.on_tx_event(wire("TxStartedEvent", "l3")).await.unwrap();
        assert!(ack.aborted);
    }

    #[tokio::test]
    async fn test_streamed_command_is_acked_separately() {
        let omega = service(&InMemoryEventStore::new());
        let config = ServiceConfig::new("booking", "booking-1");
        let mut stream = omega.open_stream(config.clone());
        assert_eq!(omega.registry().len(), 1);

        for (event_type, local) in [
            ("SagaStartedEvent", ""),
            ("TxStartedEvent", "l1"),
            ("TxEndedEvent", "l1"),
            ("TxStartedEvent", "l2"),
            ("TxAbortedEvent", "l2"),
        ] {
            omega.on_tx_event(wire(event_type, local)).await.unwrap();
        }

        let command = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command.method(), "cancel_l1");

        let (gid, local) = (GlobalTxId::from("g1"), LocalTxId::from("l1"));
        assert!(omega.ack_command(&config, &gid, &local, Ack::ok()));
        assert!(!omega.ack_command(&config, &gid, &local, Ack::ok()));

        drop(stream);
        assert!(omega.registry().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_stream_leaves_successor_connected() {
        let omega = service(&InMemoryEventStore::new());
        let config = ServiceConfig::new("booking", "booking-1");

        let first = omega.open_stream(config.clone());
        let second = omega.open_stream(config.clone());
        drop(first);
        assert_eq!(omega.registry().connected(), vec![config]);

        drop(second);
        assert!(omega.registry().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_is_rejected() {
        let omega = service(&InMemoryEventStore::new());
        let result = omega.on_tx_event(wire("TxRetriedEvent", "l1")).await;
        assert!(matches!(result, Err(ApiError::Domain(_))));
    }

    #[tokio::test]
    async fn test_leadership_gained_recovers_in_flight_sagas() {
        let store = InMemoryEventStore::new();
        let first = service(&store);
        first.on_tx_event(wire("SagaStartedEvent", "")).await.unwrap();
        first.on_tx_event(wire("TxStartedEvent", "l1")).await.unwrap();

        let successor = service(&store);
        assert_eq!(successor.on_leadership_gained().await.unwrap(), 1);

        let tx = successor.saga().transaction(&"g1".into()).await.unwrap().unwrap();
        assert_eq!(tx.state(), SagaState::Committing);
        assert_eq!(tx.sub_transactions().len(), 1);
    }
}
