//! Saga global transaction and its sub-transactions.

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId};
use domain::{
    CompensateCommand, DomainEvent, EventMeta, SagaEvent, TransactionStatus, TransactionType,
    TxStartedData,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state::SagaState;

/// Progress of a sub-transaction's compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    #[default]
    NotRequired,
    /// Command emitted, acknowledgment outstanding.
    Pending,
    Compensated,
}

/// One participant's leg of a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTransaction {
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
    pub service_name: String,
    pub instance_id: String,
    pub compensation_method: String,
    pub payloads: Vec<u8>,
    pub timeout: u32,
    pub retry_method: String,
    pub retries: u32,
    pub status: TransactionStatus,
    pub compensation: CompensationStatus,
    pub started_at: DateTime<Utc>,
    /// 1-based position among the sub-transactions that succeeded.
    pub completed_order: Option<u64>,
}

impl SubTransaction {
    fn from_started(data: &TxStartedData) -> Self {
        Self {
            local_tx_id: data.meta.local_tx_id.clone(),
            parent_tx_id: data.meta.parent_tx_id.clone(),
            service_name: data.meta.service_name.clone(),
            instance_id: data.meta.instance_id.clone(),
            compensation_method: data.compensation_method.clone(),
            payloads: data.payloads.clone(),
            timeout: data.timeout,
            retry_method: data.retry_method.clone(),
            retries: data.retries,
            status: TransactionStatus::Unknown,
            compensation: CompensationStatus::NotRequired,
            started_at: data.meta.timestamp,
            completed_order: None,
        }
    }

    fn compensate_command(&self, global_tx_id: &GlobalTxId) -> CompensateCommand {
        CompensateCommand {
            global_tx_id: global_tx_id.clone(),
            local_tx_id: self.local_tx_id.clone(),
            parent_tx_id: self.parent_tx_id.clone(),
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            compensation_method: self.compensation_method.clone(),
            payloads: self.payloads.clone(),
        }
    }
}

/// What applying an event did to the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// The event changed the transaction.
    Applied,
    /// The event repeated one already applied.
    Duplicate,
    /// The transaction was already terminal.
    Ignored,
    /// Out of causal order; recorded only.
    Illegal,
    /// No transaction exists for the event.
    Orphan,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Ignored => "ignored",
            EventOutcome::Illegal => "illegal",
            EventOutcome::Orphan => "orphan",
        }
    }
}

/// Entry of a transaction's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_type: String,
    pub local_tx_id: LocalTxId,
    pub timestamp: DateTime<Utc>,
    pub outcome: EventOutcome,
}

/// Result of a successful [`GlobalTransaction::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub state: SagaState,
    pub outcome: EventOutcome,
    /// Compensations to dispatch, in the order they must run.
    pub compensations: Vec<CompensateCommand>,
}

type Step = std::result::Result<(EventOutcome, Vec<CompensateCommand>), &'static str>;

/// One saga global transaction.
///
/// Created from a `SagaStartedEvent` and driven by every later event with the
/// same global id. Once terminal, further events are logged but change
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTransaction {
    global_tx_id: GlobalTxId,
    transaction_type: TransactionType,
    service_name: String,
    instance_id: String,
    begin_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    state: SagaState,
    sub_tx_size: u32,
    duration_ms: Option<i64>,
    /// Seconds before the saga is suspended; 0 disables the timeout.
    timeout: u32,
    suspension_reason: Option<String>,
    sub_transactions: Vec<SubTransaction>,
    events: Vec<RecordedEvent>,
    completions: u64,
}

impl GlobalTransaction {
    /// Creates a transaction from its start event.
    ///
    /// Any other event has no transaction to belong to and is an orphan.
    pub fn from_event(event: &SagaEvent) -> Result<Self> {
        let SagaEvent::SagaStartedEvent(data) = event else {
            return Err(SagaError::OrphanEvent {
                global_tx_id: event.global_tx_id().clone(),
                event_type: event.event_type(),
            });
        };

        let meta = &data.meta;
        let mut tx = Self {
            global_tx_id: meta.global_tx_id.clone(),
            transaction_type: TransactionType::Saga,
            service_name: meta.service_name.clone(),
            instance_id: meta.instance_id.clone(),
            begin_time: meta.timestamp,
            end_time: None,
            state: SagaState::Committing,
            sub_tx_size: 0,
            duration_ms: None,
            timeout: data.timeout,
            suspension_reason: None,
            sub_transactions: Vec::new(),
            events: Vec::new(),
            completions: 0,
        };
        tx.record(event, EventOutcome::Applied);
        Ok(tx)
    }

    /// Applies the next event of this transaction.
    ///
    /// Every event with a matching global id is appended to the event log,
    /// including those that end in `IllegalTransition`.
    pub fn apply(&mut self, event: &SagaEvent) -> Result<Applied> {
        if event.global_tx_id() != &self.global_tx_id {
            return Err(SagaError::OrphanEvent {
                global_tx_id: event.global_tx_id().clone(),
                event_type: event.event_type(),
            });
        }

        if self.state.is_terminal() {
            self.record(event, EventOutcome::Ignored);
            return Ok(Applied {
                state: self.state,
                outcome: EventOutcome::Ignored,
                compensations: Vec::new(),
            });
        }

        let step = match event {
            SagaEvent::SagaStartedEvent(_) => Ok((EventOutcome::Duplicate, Vec::new())),
            SagaEvent::TxStartedEvent(data) => Ok(self.on_tx_started(data)),
            SagaEvent::TxEndedEvent(data) => self.on_tx_ended(&data.meta),
            SagaEvent::TxAbortedEvent(data) => self.on_tx_aborted(&data.meta),
            SagaEvent::TxCompensatedEvent(data) => self.on_tx_compensated(&data.meta),
            SagaEvent::SagaEndedEvent(data) => self.on_saga_ended(&data.meta),
            SagaEvent::SagaAbortedEvent(data) => Ok(self.on_saga_aborted(&data.meta)),
        };

        match step {
            Ok((outcome, compensations)) => {
                self.record(event, outcome);
                Ok(Applied {
                    state: self.state,
                    outcome,
                    compensations,
                })
            }
            Err(reason) => {
                self.record(event, EventOutcome::Illegal);
                Err(SagaError::IllegalTransition {
                    global_tx_id: self.global_tx_id.clone(),
                    local_tx_id: event.meta().local_tx_id.clone(),
                    event_type: event.event_type(),
                    state: self.state,
                    reason,
                })
            }
        }
    }

    /// Moves a non-terminal transaction to `Suspended`.
    ///
    /// Returns false if the transaction had already finished.
    pub fn suspend(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.suspension_reason = Some(reason.into());
        self.finish(SagaState::Suspended, at);
        true
    }

    fn on_tx_started(&mut self, data: &TxStartedData) -> (EventOutcome, Vec<CompensateCommand>) {
        if self.sub(&data.meta.local_tx_id).is_some() {
            return (EventOutcome::Duplicate, Vec::new());
        }
        self.sub_transactions.push(SubTransaction::from_started(data));
        self.sub_tx_size += 1;
        (EventOutcome::Applied, Vec::new())
    }

    fn on_tx_ended(&mut self, meta: &EventMeta) -> Step {
        let compensating = self.state == SagaState::Compensating;
        let order = self.completions + 1;
        let global_tx_id = &self.global_tx_id;
        let Some(sub) = self
            .sub_transactions
            .iter_mut()
            .find(|s| s.local_tx_id == meta.local_tx_id)
        else {
            return Err("no matching TxStartedEvent");
        };

        match sub.status {
            TransactionStatus::Succeed => Ok((EventOutcome::Duplicate, Vec::new())),
            TransactionStatus::Failed => Err("sub-transaction already failed"),
            TransactionStatus::Unknown => {
                sub.status = TransactionStatus::Succeed;
                sub.completed_order = Some(order);

                // Finished after the abort: undo it right away.
                let mut compensations = Vec::new();
                if compensating {
                    sub.compensation = CompensationStatus::Pending;
                    compensations.push(sub.compensate_command(global_tx_id));
                }

                self.completions = order;
                Ok((EventOutcome::Applied, compensations))
            }
        }
    }

    fn on_tx_aborted(&mut self, meta: &EventMeta) -> Step {
        let Some(sub) = self.sub_mut(&meta.local_tx_id) else {
            return Err("no matching TxStartedEvent");
        };

        let outcome = match sub.status {
            TransactionStatus::Unknown => {
                sub.status = TransactionStatus::Failed;
                EventOutcome::Applied
            }
            TransactionStatus::Failed => EventOutcome::Duplicate,
            TransactionStatus::Succeed => return Err("sub-transaction already succeeded"),
        };

        Ok((outcome, self.begin_compensation()))
    }

    fn on_tx_compensated(&mut self, meta: &EventMeta) -> Step {
        let Some(sub) = self.sub_mut(&meta.local_tx_id) else {
            return Err("no matching TxStartedEvent");
        };

        match sub.compensation {
            CompensationStatus::Pending => {
                sub.compensation = CompensationStatus::Compensated;
                self.complete_if_compensated(meta.timestamp);
                Ok((EventOutcome::Applied, Vec::new()))
            }
            CompensationStatus::Compensated => Ok((EventOutcome::Duplicate, Vec::new())),
            CompensationStatus::NotRequired => Err("no compensation was requested"),
        }
    }

    fn on_saga_ended(&mut self, meta: &EventMeta) -> Step {
        if self.state != SagaState::Committing {
            return Err("saga is compensating");
        }
        if self
            .sub_transactions
            .iter()
            .any(|s| s.status != TransactionStatus::Succeed)
        {
            return Err("sub-transactions have not all succeeded");
        }
        self.finish(SagaState::Committed, meta.timestamp);
        Ok((EventOutcome::Applied, Vec::new()))
    }

    fn on_saga_aborted(&mut self, meta: &EventMeta) -> (EventOutcome, Vec<CompensateCommand>) {
        let compensations = self.begin_compensation();
        self.complete_if_compensated(meta.timestamp);
        (EventOutcome::Applied, compensations)
    }

    /// Enters `Compensating` and emits a compensation for every succeeded
    /// sub-transaction, most recently completed first.
    fn begin_compensation(&mut self) -> Vec<CompensateCommand> {
        if self.state != SagaState::Committing {
            return Vec::new();
        }
        self.state = SagaState::Compensating;

        let global_tx_id = &self.global_tx_id;
        let mut succeeded: Vec<&mut SubTransaction> = self
            .sub_transactions
            .iter_mut()
            .filter(|s| {
                s.status == TransactionStatus::Succeed
                    && s.compensation == CompensationStatus::NotRequired
            })
            .collect();
        succeeded.sort_by(|a, b| b.completed_order.cmp(&a.completed_order));

        succeeded
            .into_iter()
            .map(|sub| {
                sub.compensation = CompensationStatus::Pending;
                sub.compensate_command(global_tx_id)
            })
            .collect()
    }

    /// Finishes compensation once nothing is pending or still running.
    fn complete_if_compensated(&mut self, at: DateTime<Utc>) {
        let done = self.sub_transactions.iter().all(|s| {
            s.compensation != CompensationStatus::Pending && s.status != TransactionStatus::Unknown
        });
        if self.state == SagaState::Compensating && done {
            self.finish(SagaState::Compensated, at);
        }
    }

    fn finish(&mut self, state: SagaState, at: DateTime<Utc>) {
        self.state = state;
        self.end_time = Some(at);
        self.duration_ms = Some((at - self.begin_time).num_milliseconds());
    }

    fn record(&mut self, event: &SagaEvent, outcome: EventOutcome) {
        let meta = event.meta();
        self.events.push(RecordedEvent {
            event_type: event.event_type().to_string(),
            local_tx_id: meta.local_tx_id.clone(),
            timestamp: meta.timestamp,
            outcome,
        });
    }

    fn sub_mut(&mut self, local_tx_id: &LocalTxId) -> Option<&mut SubTransaction> {
        self.sub_transactions
            .iter_mut()
            .find(|s| &s.local_tx_id == local_tx_id)
    }
}

// Query methods
impl GlobalTransaction {
    pub fn global_tx_id(&self) -> &GlobalTxId {
        &self.global_tx_id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.transaction_type
    }

    /// Service that started the saga.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn begin_time(&self) -> DateTime<Utc> {
        self.begin_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Time from start to the terminal state, once reached.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.duration_ms.map(chrono::Duration::milliseconds)
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn sub_tx_size(&self) -> u32 {
        self.sub_tx_size
    }

    pub fn sub_transactions(&self) -> &[SubTransaction] {
        &self.sub_transactions
    }

    pub fn sub(&self, local_tx_id: &LocalTxId) -> Option<&SubTransaction> {
        self.sub_transactions
            .iter()
            .find(|s| &s.local_tx_id == local_tx_id)
    }

    /// Every event received for this transaction, in arrival order.
    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    pub fn suspension_reason(&self) -> Option<&str> {
        self.suspension_reason.as_deref()
    }

    /// Compensations emitted but not yet acknowledged.
    pub fn pending_compensations(&self) -> usize {
        self.sub_transactions
            .iter()
            .filter(|s| s.compensation == CompensationStatus::Pending)
            .count()
    }
}
