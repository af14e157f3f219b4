//! Saga coordinator: serializes events per transaction, audits them and
//! dispatches compensations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use callback::Dispatcher;
use chrono::Utc;
use cluster::LeaderGate;
use common::GlobalTxId;
use domain::{Command, CompensateCommand, DomainEvent, SagaEvent, TransactionType};
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, TransactionSnapshot, Version,
};
use serde_json::json;
use tokio::sync::Mutex;

use crate::error::{Result, SagaError};
use crate::state::SagaState;
use crate::transaction::{Applied, EventOutcome, GlobalTransaction};

/// Saga coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaConfig {
    /// How long a transaction may stay `Compensating` before it is suspended.
    pub compensation_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            compensation_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Saga,
    Compensation,
}

impl Deadline {
    fn reason(&self) -> &'static str {
        match self {
            Deadline::Saga => "timeout",
            Deadline::Compensation => "compensation timeout",
        }
    }

    fn applies_to(&self, state: SagaState) -> bool {
        match self {
            Deadline::Saga => !state.is_terminal(),
            Deadline::Compensation => state == SagaState::Compensating,
        }
    }
}

/// In-memory copy of one transaction plus its log position.
struct Slot {
    global_tx_id: GlobalTxId,
    loaded: bool,
    transaction: Option<GlobalTransaction>,
    version: Version,
}

impl Slot {
    fn new(global_tx_id: GlobalTxId) -> Self {
        Self {
            global_tx_id,
            loaded: false,
            transaction: None,
            version: Version::initial(),
        }
    }

    fn apply(&mut self, event: &SagaEvent) -> Result<Applied> {
        match &mut self.transaction {
            Some(tx) => tx.apply(event),
            None => {
                let tx = GlobalTransaction::from_event(event)?;
                let applied = Applied {
                    state: tx.state(),
                    outcome: EventOutcome::Applied,
                    compensations: Vec::new(),
                };
                self.transaction = Some(tx);
                Ok(applied)
            }
        }
    }

    /// True once nothing more can change in memory: the transaction is
    /// terminal, or the id never started a saga.
    fn is_finished(&self) -> bool {
        self.loaded
            && self
                .transaction
                .as_ref()
                .is_none_or(|tx| tx.state().is_terminal())
    }

    /// Forces the next access to reload from storage.
    fn invalidate(&mut self) {
        self.loaded = false;
        self.transaction = None;
        self.version = Version::initial();
    }
}

struct Inner {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    gate: LeaderGate,
    config: SagaConfig,
    slots: StdMutex<HashMap<GlobalTxId, Arc<Mutex<Slot>>>>,
}

/// Drives saga global transactions.
///
/// Events of one global transaction are applied one at a time; different
/// transactions proceed in parallel. Every event is appended to the event
/// store and the transaction summary is saved after each change, so another
/// instance can take over after a leadership change. Clones share state.
#[derive(Clone)]
pub struct SagaCoordinator {
    inner: Arc<Inner>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Dispatcher,
        gate: LeaderGate,
        config: SagaConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                gate,
                config,
                slots: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Applies one event and dispatches any compensations it triggers.
    ///
    /// Orphan and illegal events are still written to the audit log before
    /// the error is returned.
    #[tracing::instrument(
        skip(self, event),
        fields(global_tx_id = %event.global_tx_id(), event_type = event.event_type())
    )]
    pub async fn on_event(&self, event: SagaEvent) -> Result<Applied> {
        if !self.inner.gate.is_active() {
            return Err(SagaError::NotActive);
        }
        metrics::counter!("alpha_events_received_total", "protocol" => "saga").increment(1);

        let global_tx_id = event.global_tx_id().clone();
        let handle = self.slot(&global_tx_id);
        let result = self.apply_event(&handle, event).await;
        self.evict_if_finished(&global_tx_id, &handle);
        result
    }

    async fn apply_event(&self, handle: &Arc<Mutex<Slot>>, event: SagaEvent) -> Result<Applied> {
        let mut guard = handle.lock().await;
        self.load(&mut guard).await?;

        let previous = guard
            .transaction
            .as_ref()
            .map(|tx| tx.state())
            .unwrap_or_default();
        let result = guard.apply(&event);
        let outcome = match &result {
            Ok(applied) => applied.outcome,
            Err(SagaError::OrphanEvent { .. }) => EventOutcome::Orphan,
            Err(_) => EventOutcome::Illegal,
        };

        if let Err(e) = self.persist(&mut guard, &event, outcome).await {
            tracing::error!(error = %e, "failed to persist saga event");
            guard.invalidate();
            return Err(e);
        }

        let applied = match result {
            Ok(applied) => applied,
            Err(e @ SagaError::OrphanEvent { .. }) => {
                metrics::counter!("alpha_orphan_events_total").increment(1);
                tracing::warn!(error = %e, "orphan saga event recorded");
                return Err(e);
            }
            Err(e) => {
                metrics::counter!("alpha_illegal_transitions_total").increment(1);
                tracing::warn!(error = %e, "illegal saga event recorded");
                return Err(e);
            }
        };

        tracing::debug!(outcome = outcome.as_str(), state = %applied.state, "saga event applied");

        if previous != applied.state {
            tracing::info!(from = %previous, to = %applied.state, "saga state changed");
            let global_tx_id = event.global_tx_id().clone();
            match (previous, applied.state) {
                (SagaState::Idle, SagaState::Committing) => {
                    if let Some(tx) = &guard.transaction
                        && tx.timeout() > 0
                    {
                        let after = Duration::from_secs(u64::from(tx.timeout()));
                        self.arm(Deadline::Saga, global_tx_id, after);
                    }
                }
                (_, SagaState::Compensating) => {
                    let after = self.inner.config.compensation_timeout;
                    self.arm(Deadline::Compensation, global_tx_id, after);
                }
                _ => {}
            }
            if let Some(tx) = &guard.transaction {
                record_finished(tx);
            }
        }

        if !applied.compensations.is_empty() {
            self.spawn_compensations(applied.compensations.clone());
        }

        Ok(applied)
    }

    /// Returns the current view of a transaction.
    ///
    /// The active instance answers from memory when the transaction is
    /// loaded; otherwise, and always on a standby, the stored summary is
    /// read.
    pub async fn transaction(&self, global_tx_id: &GlobalTxId) -> Result<Option<GlobalTransaction>> {
        let cached = self.slots().get(global_tx_id).cloned();
        if self.inner.gate.is_active()
            && let Some(handle) = cached
        {
            let guard = handle.lock().await;
            if guard.loaded {
                return Ok(guard.transaction.clone());
            }
        }

        match self.inner.store.get_snapshot(global_tx_id).await? {
            Some(snapshot) if snapshot.transaction_type == TransactionType::Saga.as_str() => {
                Ok(Some(snapshot.into_state()?))
            }
            _ => Ok(None),
        }
    }

    /// Suspends a transaction that has not finished yet.
    pub async fn suspend(
        &self,
        global_tx_id: &GlobalTxId,
        reason: impl Into<String>,
    ) -> Result<bool> {
        self.suspend_where(global_tx_id, reason.into(), |state| !state.is_terminal())
            .await
    }

    /// Drops every cached transaction; the next access reloads from storage.
    ///
    /// Used when this instance becomes leader, since another instance may
    /// have advanced the transactions meanwhile.
    pub fn reset(&self) {
        self.slots().clear();
    }

    /// Number of transactions currently held in memory.
    pub fn cached(&self) -> usize {
        self.slots().len()
    }

    /// Loads unfinished sagas from storage and re-arms their timers.
    ///
    /// Returns the number of transactions recovered. Pending compensations
    /// are not re-sent.
    #[tracing::instrument(skip(self))]
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let mut recovered = 0;
        for state in [SagaState::Committing, SagaState::Compensating] {
            for snapshot in self.inner.store.list_snapshots(Some(state.as_str())).await? {
                if snapshot.transaction_type != TransactionType::Saga.as_str() {
                    continue;
                }
                let handle = self.slot(&snapshot.global_tx_id);
                let mut guard = handle.lock().await;
                if !guard.loaded {
                    self.load(&mut guard).await?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "in-flight sagas recovered");
        }
        Ok(recovered)
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
            .or_insert_with(|| Arc::new(Mutex::new(Slot::new(global_tx_id.clone()))))
            .clone()
    }

    /// Drops a finished transaction from memory; later reads and duplicate
    /// events go through the stored summary.
    ///
    /// The slot stays if anyone else holds or is waiting on it.
    fn evict_if_finished(&self, global_tx_id: &GlobalTxId, handle: &Arc<Mutex<Slot>>) {
        let mut slots = self.slots();
        let current = slots
            .get(global_tx_id)
            .is_some_and(|cached| Arc::ptr_eq(cached, handle));
        // One reference in the map, one held by the caller.
        if !current || Arc::strong_count(handle) > 2 {
            return;
        }
        let finished = handle.try_lock().is_ok_and(|slot| slot.is_finished());
        if finished {
            slots.remove(global_tx_id);
        }
    }

    /// Rebuilds the slot from the stored summary plus any newer events.
    async fn load(&self, slot: &mut Slot) -> Result<()> {
        if slot.loaded {
            return Ok(());
        }

        let store = &self.inner.store;
        let (mut transaction, mut version) = match store.get_snapshot(&slot.global_tx_id).await? {
            Some(snapshot) if snapshot.transaction_type == TransactionType::Saga.as_str() => {
                let version = snapshot.version;
                (Some(snapshot.into_state::<GlobalTransaction>()?), version)
            }
            _ => (None, Version::initial()),
        };

        let events = store
            .get_events_for_transaction_from_version(&slot.global_tx_id, version.next())
            .await?;
        let replayed = events.len();
        for envelope in events {
            version = envelope.version;
            if envelope.transaction_type != TransactionType::Saga.as_str() {
                continue;
            }
            let Ok(event) = serde_json::from_value::<SagaEvent>(envelope.payload) else {
                continue;
            };
            // Replay only rebuilds state; commands were sent the first time.
            match &mut transaction {
                Some(tx) => {
                    let _ = tx.apply(&event);
                }
                None => transaction = GlobalTransaction::from_event(&event).ok(),
            }
        }

        if let Some(tx) = &transaction {
            tracing::debug!(
                global_tx_id = %slot.global_tx_id,
                state = %tx.state(),
                replayed,
                "saga loaded from storage"
            );
            self.arm_recovered(tx);
        }

        slot.transaction = transaction;
        slot.version = version;
        slot.loaded = true;
        Ok(())
    }

    async fn persist(&self, slot: &mut Slot, event: &SagaEvent, outcome: EventOutcome) -> Result<()> {
        let version = slot.version.next();
        let envelope = audit_envelope(event, version, outcome)?;
        slot.version = self
            .inner
            .store
            .append(vec![envelope], AppendOptions::expect_version(slot.version))
            .await?;

        if let Some(tx) = &slot.transaction {
            self.save_snapshot(tx, slot.version).await?;
        }
        Ok(())
    }

    async fn save_snapshot(&self, tx: &GlobalTransaction, version: Version) -> Result<()> {
        let snapshot = TransactionSnapshot::from_state(
            tx.global_tx_id().clone(),
            TransactionType::Saga.as_str(),
            tx.state().as_str(),
            version,
            tx,
        )?;
        self.inner.store.save_snapshot(snapshot).await?;
        Ok(())
    }

    async fn suspend_where(
        &self,
        global_tx_id: &GlobalTxId,
        reason: String,
        applies: impl Fn(SagaState) -> bool,
    ) -> Result<bool> {
        if !self.inner.gate.is_active() {
            return Err(SagaError::NotActive);
        }

        let handle = self.slot(global_tx_id);
        let suspended = self.suspend_slot(&handle, global_tx_id, reason, applies).await;
        self.evict_if_finished(global_tx_id, &handle);
        suspended
    }

    async fn suspend_slot(
        &self,
        handle: &Arc<Mutex<Slot>>,
        global_tx_id: &GlobalTxId,
        reason: String,
        applies: impl Fn(SagaState) -> bool,
    ) -> Result<bool> {
        let mut guard = handle.lock().await;
        self.load(&mut guard).await?;

        let slot = &mut *guard;
        let Some(tx) = slot.transaction.as_mut() else {
            return Ok(false);
        };
        if !applies(tx.state()) || !tx.suspend(reason.as_str(), Utc::now()) {
            return Ok(false);
        }

        tracing::warn!(%global_tx_id, reason = %reason, "saga suspended");
        record_finished(tx);
        self.save_snapshot(tx, slot.version).await?;
        Ok(true)
    }

    fn arm(&self, deadline: Deadline, global_tx_id: GlobalTxId, after: Duration) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if !coordinator.inner.gate.is_active() {
                return;
            }
            let reason = deadline.reason().to_string();
            if let Err(e) = coordinator
                .suspend_where(&global_tx_id, reason, |state| deadline.applies_to(state))
                .await
            {
                tracing::error!(%global_tx_id, error = %e, "failed to suspend timed out saga");
            }
        });
    }

    fn arm_recovered(&self, tx: &GlobalTransaction) {
        let global_tx_id = tx.global_tx_id().clone();
        match tx.state() {
            SagaState::Committing if tx.timeout() > 0 => {
                let deadline = tx.begin_time() + chrono::Duration::seconds(i64::from(tx.timeout()));
                let after = (deadline - Utc::now()).to_std().unwrap_or_default();
                self.arm(Deadline::Saga, global_tx_id, after);
            }
            SagaState::Compensating => {
                self.arm(
                    Deadline::Compensation,
                    global_tx_id,
                    self.inner.config.compensation_timeout,
                );
            }
            _ => {}
        }
    }

    fn spawn_compensations(&self, commands: Vec<CompensateCommand>) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.dispatch_compensations(commands).await });
    }

    /// Sends compensations one after another, in the given order.
    ///
    /// The first undeliverable command suspends the transaction and stops
    /// the rest.
    async fn dispatch_compensations(&self, commands: Vec<CompensateCommand>) {
        for command in commands {
            if !self.inner.gate.is_active() {
                tracing::warn!(
                    global_tx_id = %command.global_tx_id,
                    "leadership lost, compensation left pending"
                );
                return;
            }

            let global_tx_id = command.global_tx_id.clone();
            let local_tx_id = command.local_tx_id.clone();
            match self.inner.dispatcher.dispatch(Command::Compensate(command)).await {
                Ok(_) => {
                    metrics::counter!("alpha_compensations_dispatched_total").increment(1);
                    tracing::debug!(%global_tx_id, %local_tx_id, "compensation delivered");
                }
                Err(e) => {
                    let reason = format!("compensation of {local_tx_id} undeliverable: {e}");
                    if let Err(err) = self.suspend(&global_tx_id, reason).await {
                        tracing::error!(%global_tx_id, error = %err, "failed to suspend saga");
                    }
                    return;
                }
            }
        }
    }
}

fn audit_envelope(event: &SagaEvent, version: Version, outcome: EventOutcome) -> Result<EventEnvelope> {
    let meta = event.meta();
    EventEnvelope::builder()
        .event_type(event.event_type())
        .global_tx_id(meta.global_tx_id.clone())
        .transaction_type(TransactionType::Saga.as_str())
        .version(version)
        .timestamp(meta.timestamp)
        .payload(event)?
        .metadata("outcome", json!(outcome.as_str()))
        .metadata("service_name", json!(meta.service_name))
        .metadata("instance_id", json!(meta.instance_id))
        .metadata("local_tx_id", json!(meta.local_tx_id))
        .try_build()
        .ok_or_else(|| {
            SagaError::EventStore(EventStoreError::InvalidAppend(
                "incomplete audit envelope".to_string(),
            ))
        })
}

fn record_finished(tx: &GlobalTransaction) {
    match tx.state() {
        SagaState::Committed => metrics::counter!("alpha_sagas_committed_total").increment(1),
        SagaState::Compensated => metrics::counter!("alpha_sagas_compensated_total").increment(1),
        SagaState::Suspended => metrics::counter!("alpha_sagas_suspended_total").increment(1),
        _ => return,
    }
    if let Some(duration) = tx.duration() {
        metrics::histogram!("alpha_saga_duration_seconds")
            .record(duration.num_milliseconds() as f64 / 1000.0);
    }
}
