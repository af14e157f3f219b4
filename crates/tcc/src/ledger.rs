//! Participation ledger: who takes part in each TCC transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId, ServiceConfig};
use domain::{
    CoordinateCommand, Coordination, DomainEvent, EventMeta, ParticipatedData, TccEndedData,
    TccEvent, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One participant's registration in a TCC transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationRecord {
    pub global_tx_id: GlobalTxId,
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: String,
    pub instance_id: String,
    pub confirm_method: String,
    pub cancel_method: String,
    /// Outcome of the participant's try phase.
    pub status: TransactionStatus,
    pub participated_at: DateTime<Utc>,
}

impl ParticipationRecord {
    pub fn from_event(data: &ParticipatedData) -> Self {
        let meta = &data.meta;
        Self {
            global_tx_id: meta.global_tx_id.clone(),
            local_tx_id: meta.local_tx_id.clone(),
            parent_tx_id: meta.parent_tx_id.clone(),
            service_name: meta.service_name.clone(),
            instance_id: meta.instance_id.clone(),
            confirm_method: data.confirm_method.clone(),
            cancel_method: data.cancel_method.clone(),
            status: data.status,
            participated_at: meta.timestamp,
        }
    }

    pub fn target(&self) -> ServiceConfig {
        ServiceConfig::new(self.service_name.clone(), self.instance_id.clone())
    }

    /// Builds the confirm or cancel command for this participant.
    pub fn command(&self, coordination: Coordination) -> CoordinateCommand {
        let method = match coordination {
            Coordination::Confirm => &self.confirm_method,
            Coordination::Cancel => &self.cancel_method,
        };
        CoordinateCommand {
            global_tx_id: self.global_tx_id.clone(),
            local_tx_id: self.local_tx_id.clone(),
            parent_tx_id: self.parent_tx_id.clone(),
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            coordination,
            method: method.clone(),
        }
    }
}

/// Result of applying an event to a [`TccTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TccApplied {
    /// False when the event repeated an earlier one.
    pub changed: bool,
    /// Set when this event took the confirm/cancel decision.
    pub decided: Option<Coordination>,
    /// Commands to send, one per participant.
    pub commands: Vec<CoordinateCommand>,
}

/// Participants and outcome of one TCC global transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TccTransaction {
    global_tx_id: GlobalTxId,
    /// In order of first registration.
    participants: Vec<ParticipationRecord>,
    started: BTreeMap<LocalTxId, DateTime<Utc>>,
    status: Option<TransactionStatus>,
    coordination: Option<Coordination>,
    ended_at: Option<DateTime<Utc>>,
}

impl TccTransaction {
    pub fn new(global_tx_id: GlobalTxId) -> Self {
        Self {
            global_tx_id,
            participants: Vec::new(),
            started: BTreeMap::new(),
            status: None,
            coordination: None,
            ended_at: None,
        }
    }

    /// Registers a participant; a repeated local id overwrites in place.
    ///
    /// Returns true for a new participant.
    pub fn participate(&mut self, data: &ParticipatedData) -> bool {
        let record = ParticipationRecord::from_event(data);
        match self
            .participants
            .iter_mut()
            .find(|p| p.local_tx_id == record.local_tx_id)
        {
            Some(existing) => {
                *existing = record;
                false
            }
            None => {
                self.participants.push(record);
                true
            }
        }
    }

    /// Notes when a local transaction started. Returns false if already known.
    pub fn record_started(&mut self, meta: &EventMeta) -> bool {
        if self.started.contains_key(&meta.local_tx_id) {
            return false;
        }
        self.started
            .insert(meta.local_tx_id.clone(), meta.timestamp);
        true
    }

    /// Takes the confirm/cancel decision.
    ///
    /// Only `Succeed` confirms. Returns None if the decision was already
    /// taken.
    pub fn complete(&mut self, data: &TccEndedData) -> Option<Coordination> {
        if self.coordination.is_some() {
            return None;
        }
        let coordination = match data.status {
            TransactionStatus::Succeed => Coordination::Confirm,
            TransactionStatus::Failed | TransactionStatus::Unknown => Coordination::Cancel,
        };
        self.status = Some(data.status);
        self.coordination = Some(coordination);
        self.ended_at = Some(data.meta.timestamp);
        Some(coordination)
    }

    /// Applies an event and returns the commands it calls for.
    ///
    /// A participant registering after the decision gets the decided
    /// command on its own.
    pub fn apply(&mut self, event: &TccEvent) -> TccApplied {
        match event {
            TccEvent::ParticipatedEvent(data) => {
                let changed = self.participate(data);
                let commands = match self.coordination {
                    Some(coordination) if changed => self
                        .participant(&data.meta.local_tx_id)
                        .map(|p| vec![p.command(coordination)])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };
                TccApplied {
                    changed,
                    decided: None,
                    commands,
                }
            }
            TccEvent::TccTransactionStartedEvent(data) => TccApplied {
                changed: self.record_started(&data.meta),
                ..TccApplied::default()
            },
            TccEvent::TccTransactionEndedEvent(data) => match self.complete(data) {
                Some(coordination) => TccApplied {
                    changed: true,
                    decided: Some(coordination),
                    commands: self.commands(coordination),
                },
                None => TccApplied::default(),
            },
        }
    }

    fn commands(&self, coordination: Coordination) -> Vec<CoordinateCommand> {
        self.participants
            .iter()
            .map(|p| p.command(coordination))
            .collect()
    }

    pub fn global_tx_id(&self) -> &GlobalTxId {
        &self.global_tx_id
    }

    pub fn participants(&self) -> &[ParticipationRecord] {
        &self.participants
    }

    pub fn participant(&self, local_tx_id: &LocalTxId) -> Option<&ParticipationRecord> {
        self.participants
            .iter()
            .find(|p| &p.local_tx_id == local_tx_id)
    }

    pub fn started_at(&self, local_tx_id: &LocalTxId) -> Option<DateTime<Utc>> {
        self.started.get(local_tx_id).copied()
    }

    /// Status reported by the ending event, once received.
    pub fn status(&self) -> Option<TransactionStatus> {
        self.status
    }

    pub fn coordination(&self) -> Option<Coordination> {
        self.coordination
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// State name used in transaction snapshots.
    pub fn state_name(&self) -> &'static str {
        match self.coordination {
            None => "ONGOING",
            Some(Coordination::Confirm) => "CONFIRMED",
            Some(Coordination::Cancel) => "CANCELLED",
        }
    }
}

/// Shared map of TCC transactions keyed by global id.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct TccLedger {
    transactions: Arc<RwLock<HashMap<GlobalTxId, TccTransaction>>>,
}

impl TccLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant. Returns true for a new `(global, local)` pair.
    pub async fn participate(&self, data: &ParticipatedData) -> bool {
        self.transactions
            .write()
            .await
            .entry(data.meta.global_tx_id.clone())
            .or_insert_with(|| TccTransaction::new(data.meta.global_tx_id.clone()))
            .participate(data)
    }

    /// Records the start time of a local transaction.
    pub async fn on_transaction_started(&self, meta: &EventMeta) {
        self.transactions
            .write()
            .await
            .entry(meta.global_tx_id.clone())
            .or_insert_with(|| TccTransaction::new(meta.global_tx_id.clone()))
            .record_started(meta);
    }

    /// Takes the decision for a transaction and returns the participants to
    /// notify, or None if the decision was already taken.
    pub async fn on_transaction_ended(
        &self,
        data: &TccEndedData,
    ) -> Option<(Coordination, Vec<ParticipationRecord>)> {
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .entry(data.meta.global_tx_id.clone())
            .or_insert_with(|| TccTransaction::new(data.meta.global_tx_id.clone()));
        let coordination = tx.complete(data)?;
        Some((coordination, tx.participants.clone()))
    }

    /// Applies any TCC event, returning the commands it calls for and the
    /// updated transaction.
    pub async fn apply(&self, event: &TccEvent) -> (TccApplied, TccTransaction) {
        let global_tx_id = event.global_tx_id();
        let mut transactions = self.transactions.write().await;
        let tx = transactions
            .entry(global_tx_id.clone())
            .or_insert_with(|| TccTransaction::new(global_tx_id.clone()));
        let applied = tx.apply(event);
        (applied, tx.clone())
    }

    /// All participation records of a transaction.
    pub async fn retrieve(&self, global_tx_id: &GlobalTxId) -> Vec<ParticipationRecord> {
        self.transactions
            .read()
            .await
            .get(global_tx_id)
            .map(|tx| tx.participants.clone())
            .unwrap_or_default()
    }

    pub async fn transaction(&self, global_tx_id: &GlobalTxId) -> Option<TccTransaction> {
        self.transactions.read().await.get(global_tx_id).cloned()
    }

    /// Replaces a transaction with one rebuilt from storage.
    pub async fn restore(&self, tx: TccTransaction) {
        self.transactions
            .write()
            .await
            .insert(tx.global_tx_id.clone(), tx);
    }

    /// Drops a transaction whose outcome is already stored.
    pub async fn remove(&self, global_tx_id: &GlobalTxId) -> Option<TccTransaction> {
        self.transactions.write().await.remove(global_tx_id)
    }

    pub async fn clear(&self) {
        self.transactions.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
