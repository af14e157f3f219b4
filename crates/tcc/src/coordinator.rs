//! TCC coordinator: records participation and fans out confirm/cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use callback::Dispatcher;
use cluster::LeaderGate;
use common::GlobalTxId;
use domain::{Command, CoordinateCommand, Coordination, DomainEvent, TccEvent, TransactionType};
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, TransactionSnapshot, Version,
};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::{Result, TccError};
use crate::ledger::{ParticipationRecord, TccLedger, TccTransaction};

/// Log position of one transaction on this instance.
#[derive(Default)]
struct Slot {
    loaded: bool,
    version: Version,
}

struct Inner {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    gate: LeaderGate,
    ledger: TccLedger,
    slots: StdMutex<HashMap<GlobalTxId, Arc<Mutex<Slot>>>>,
}

/// Drives TCC global transactions.
///
/// Events of one transaction are handled one at a time. When the ending
/// event arrives every participant gets its command from an independent
/// task with its own retries. Clones share state.
#[derive(Clone)]
pub struct TccCoordinator {
    inner: Arc<Inner>,
}

impl TccCoordinator {
    pub fn new(store: Arc<dyn EventStore>, dispatcher: Dispatcher, gate: LeaderGate) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                gate,
                ledger: TccLedger::new(),
                slots: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &TccLedger {
        &self.inner.ledger
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Handles one TCC event.
    ///
    /// Returns the decision when this event took it; duplicate ending
    /// events return None and send nothing.
    #[tracing::instrument(
        skip(self, event),
        fields(global_tx_id = %event.global_tx_id(), event_type = event.event_type())
    )]
    pub async fn on_event(&self, event: TccEvent) -> Result<Option<Coordination>> {
        if !self.inner.gate.is_active() {
            return Err(TccError::NotActive);
        }
        metrics::counter!("alpha_events_received_total", "protocol" => "tcc").increment(1);

        let global_tx_id = event.global_tx_id().clone();
        let handle = self.slot(&global_tx_id);
        let mut slot = handle.lock().await;
        self.load(&global_tx_id, &mut slot).await?;

        let (applied, tx) = self.inner.ledger.apply(&event).await;
        let outcome = if applied.changed { "applied" } else { "duplicate" };

        if let Err(e) = self.persist(&mut slot, &event, outcome, &tx).await {
            tracing::error!(error = %e, "failed to persist tcc event");
            // Rebuild from storage on the next event.
            slot.loaded = false;
            return Err(e);
        }
        tracing::debug!(outcome, "tcc event applied");

        if let Some(coordination) = applied.decided {
            tracing::info!(
                %coordination,
                participants = tx.participants().len(),
                "tcc transaction ended"
            );
        }
        for command in applied.commands {
            self.spawn_dispatch(command);
        }

        if tx.coordination().is_some() {
            // Decided and stored; later events reload from the summary.
            self.inner.ledger.remove(&global_tx_id).await;
            slot.loaded = false;
            drop(slot);
            self.evict(&global_tx_id, &handle);
        }

        Ok(applied.decided)
    }

    /// Participation records of a transaction.
    pub async fn participants(&self, global_tx_id: &GlobalTxId) -> Result<Vec<ParticipationRecord>> {
        Ok(self
            .transaction(global_tx_id)
            .await?
            .map(|tx| tx.participants().to_vec())
            .unwrap_or_default())
    }

    /// Returns the current view of a transaction.
    ///
    /// The active instance answers from its ledger; a standby reads the
    /// stored summary.
    pub async fn transaction(&self, global_tx_id: &GlobalTxId) -> Result<Option<TccTransaction>> {
        if self.inner.gate.is_active()
            && let Some(tx) = self.inner.ledger.transaction(global_tx_id).await
        {
            return Ok(Some(tx));
        }

        match self.inner.store.get_snapshot(global_tx_id).await? {
            Some(snapshot) if snapshot.transaction_type == TransactionType::Tcc.as_str() => {
                Ok(Some(snapshot.into_state()?))
            }
            _ => Ok(None),
        }
    }

    /// Number of transactions currently held in memory.
    pub fn cached(&self) -> usize {
        self.slots().len()
    }

    /// Forgets cached state so the next event reloads from storage.
    pub async fn reset(&self) {
        self.slots().clear();
        self.inner.ledger.clear().await;
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<GlobalTxId, Arc<Mutex<Slot>>>> {
        match self.inner.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, global_tx_id: &GlobalTxId) -> Arc<Mutex<Slot>> {
        self.slots()
            .entry(global_tx_id.clone())
            .or_default()
            .clone()
    }

    /// Removes the slot unless another event is queued on it.
    fn evict(&self, global_tx_id: &GlobalTxId, handle: &Arc<Mutex<Slot>>) {
        let mut slots = self.slots();
        let idle = slots
            .get(global_tx_id)
            .is_some_and(|cached| Arc::ptr_eq(cached, handle))
            && Arc::strong_count(handle) <= 2
            && handle.try_lock().is_ok();
        if idle {
            slots.remove(global_tx_id);
        }
    }

    /// Rebuilds the ledger entry from the stored summary plus newer events.
    ///
    /// Replayed events never dispatch: a decision found in storage was
    /// already acted on.
    async fn load(&self, global_tx_id: &GlobalTxId, slot: &mut Slot) -> Result<()> {
        if slot.loaded {
            return Ok(());
        }

        let store = &self.inner.store;
        let (mut tx, mut version) = match store.get_snapshot(global_tx_id).await? {
            Some(snapshot) if snapshot.transaction_type == TransactionType::Tcc.as_str() => {
                let version = snapshot.version;
                (snapshot.into_state::<TccTransaction>()?, version)
            }
            _ => (TccTransaction::new(global_tx_id.clone()), Version::initial()),
        };

        let events = store
            .get_events_for_transaction_from_version(global_tx_id, version.next())
            .await?;
        for envelope in events {
            version = envelope.version;
            if envelope.transaction_type != TransactionType::Tcc.as_str() {
                continue;
            }
            if let Ok(event) = serde_json::from_value::<TccEvent>(envelope.payload) {
                tx.apply(&event);
            }
        }

        if version > Version::initial() {
            tracing::debug!(%global_tx_id, %version, "tcc transaction loaded from storage");
        }
        self.inner.ledger.restore(tx).await;
        slot.version = version;
        slot.loaded = true;
        Ok(())
    }

    async fn persist(
        &self,
        slot: &mut Slot,
        event: &TccEvent,
        outcome: &'static str,
        tx: &TccTransaction,
    ) -> Result<()> {
        let envelope = audit_envelope(event, slot.version.next(), outcome)?;
        let version = self
            .inner
            .store
            .append(vec![envelope], AppendOptions::expect_version(slot.version))
            .await?;
        slot.version = version;

        let snapshot = TransactionSnapshot::from_state(
            tx.global_tx_id().clone(),
            TransactionType::Tcc.as_str(),
            tx.state_name(),
            version,
            tx,
        )?;
        self.inner.store.save_snapshot(snapshot).await?;
        Ok(())
    }

    fn spawn_dispatch(&self, command: CoordinateCommand) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if !coordinator.inner.gate.is_active() {
                tracing::warn!(
                    global_tx_id = %command.global_tx_id,
                    "leadership lost, tcc command not sent"
                );
                return;
            }

            let coordination = command.coordination;
            let global_tx_id = command.global_tx_id.clone();
            let local_tx_id = command.local_tx_id.clone();
            match coordinator
                .inner
                .dispatcher
                .dispatch(Command::Coordinate(command))
                .await
            {
                Ok(_) => {
                    metrics::counter!(
                        "alpha_tcc_commands_dispatched_total",
                        "coordination" => coordination.as_str()
                    )
                    .increment(1);
                    tracing::debug!(%global_tx_id, %local_tx_id, %coordination, "tcc command delivered");
                }
                Err(e) => {
                    tracing::warn!(
                        %global_tx_id,
                        %local_tx_id,
                        %coordination,
                        error = %e,
                        "tcc command undeliverable"
                    );
                }
            }
        });
    }
}

fn audit_envelope(event: &TccEvent, version: Version, outcome: &'static str) -> Result<EventEnvelope> {
    let meta = event.meta();
    EventEnvelope::builder()
        .event_type(event.event_type())
        .global_tx_id(meta.global_tx_id.clone())
        .transaction_type(TransactionType::Tcc.as_str())
        .version(version)
        .timestamp(meta.timestamp)
        .payload(event)?
        .metadata("outcome", json!(outcome))
        .metadata("service_name", json!(meta.service_name))
        .metadata("instance_id", json!(meta.instance_id))
        .metadata("local_tx_id", json!(meta.local_tx_id))
        .try_build()
        .ok_or_else(|| {
            TccError::EventStore(EventStoreError::InvalidAppend(
                "incomplete audit envelope".to_string(),
            ))
        })
}
