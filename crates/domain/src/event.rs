//! Lifecycle events reported by participants.

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId};
use serde::{Deserialize, Serialize};

use crate::status::TransactionStatus;

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and named in past tense.
pub trait DomainEvent: Serialize + Send + Sync + Clone {
    /// Returns the event type name.
    ///
    /// This is the name used on the wire and in the event store.
    fn event_type(&self) -> &'static str;

    /// Returns the header fields shared by every event kind.
    fn meta(&self) -> &EventMeta;

    /// Returns the global transaction the event belongs to.
    fn global_tx_id(&self) -> &GlobalTxId {
        &self.meta().global_tx_id
    }
}

/// Header fields carried by every lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Reporting participant service.
    pub service_name: String,
    /// Reporting participant instance.
    pub instance_id: String,
    /// When the participant produced the event.
    pub timestamp: DateTime<Utc>,
    pub global_tx_id: GlobalTxId,
    pub local_tx_id: LocalTxId,
    pub parent_tx_id: Option<LocalTxId>,
}

impl EventMeta {
    /// Creates a header stamped with the current time.
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        global_tx_id: GlobalTxId,
        local_tx_id: LocalTxId,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            timestamp: Utc::now(),
            global_tx_id,
            local_tx_id,
            parent_tx_id: None,
        }
    }

    /// Header for a saga-level event, whose local id is the global id.
    pub fn for_saga(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        global_tx_id: GlobalTxId,
    ) -> Self {
        let local_tx_id = LocalTxId::from(global_tx_id.as_str());
        Self::new(service_name, instance_id, global_tx_id, local_tx_id)
    }

    pub fn with_parent(mut self, parent_tx_id: LocalTxId) -> Self {
        self.parent_tx_id = Some(parent_tx_id);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Events of the saga (compensation based) protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The initiator opened a global transaction.
    SagaStartedEvent(SagaStartedData),

    /// The initiator finished the global transaction successfully.
    SagaEndedEvent(EventData),

    /// The initiator gave up on the global transaction.
    SagaAbortedEvent(AbortedData),

    /// A participant began its local transaction.
    TxStartedEvent(TxStartedData),

    /// A participant committed its local transaction.
    TxEndedEvent(EventData),

    /// A participant's local transaction failed.
    TxAbortedEvent(AbortedData),

    /// A participant ran the compensation of its local transaction.
    TxCompensatedEvent(EventData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStartedEvent(_) => "SagaStartedEvent",
            SagaEvent::SagaEndedEvent(_) => "SagaEndedEvent",
            SagaEvent::SagaAbortedEvent(_) => "SagaAbortedEvent",
            SagaEvent::TxStartedEvent(_) => "TxStartedEvent",
            SagaEvent::TxEndedEvent(_) => "TxEndedEvent",
            SagaEvent::TxAbortedEvent(_) => "TxAbortedEvent",
            SagaEvent::TxCompensatedEvent(_) => "TxCompensatedEvent",
        }
    }

    fn meta(&self) -> &EventMeta {
        match self {
            SagaEvent::SagaStartedEvent(data) => &data.meta,
            SagaEvent::SagaEndedEvent(data) => &data.meta,
            SagaEvent::SagaAbortedEvent(data) => &data.meta,
            SagaEvent::TxStartedEvent(data) => &data.meta,
            SagaEvent::TxEndedEvent(data) => &data.meta,
            SagaEvent::TxAbortedEvent(data) => &data.meta,
            SagaEvent::TxCompensatedEvent(data) => &data.meta,
        }
    }
}

/// Events of the try-confirm-cancel protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TccEvent {
    /// A participant finished its try phase and registered confirm/cancel.
    ParticipatedEvent(ParticipatedData),

    /// The initiator started a TCC transaction.
    TccTransactionStartedEvent(EventData),

    /// The initiator ended a TCC transaction with the given outcome.
    TccTransactionEndedEvent(TccEndedData),
}

impl DomainEvent for TccEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TccEvent::ParticipatedEvent(_) => "ParticipatedEvent",
            TccEvent::TccTransactionStartedEvent(_) => "TccTransactionStartedEvent",
            TccEvent::TccTransactionEndedEvent(_) => "TccTransactionEndedEvent",
        }
    }

    fn meta(&self) -> &EventMeta {
        match self {
            TccEvent::ParticipatedEvent(data) => &data.meta,
            TccEvent::TccTransactionStartedEvent(data) => &data.meta,
            TccEvent::TccTransactionEndedEvent(data) => &data.meta,
        }
    }
}

/// Data for events that carry only the header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub meta: EventMeta,
}

/// Data for SagaStartedEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub meta: EventMeta,
    /// Seconds before the saga is suspended; 0 disables the timeout.
    pub timeout: u32,
}

/// Data for SagaAbortedEvent and TxAbortedEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortedData {
    pub meta: EventMeta,
    /// Opaque failure payload (usually the serialized error).
    pub payloads: Vec<u8>,
}

/// Data for TxStartedEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxStartedData {
    pub meta: EventMeta,
    /// Method the participant runs to undo this local transaction.
    pub compensation_method: String,
    /// Opaque arguments replayed with the compensation.
    pub payloads: Vec<u8>,
    pub timeout: u32,
    pub retry_method: String,
    pub retries: u32,
}

/// Data for ParticipatedEvent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipatedData {
    pub meta: EventMeta,
    pub confirm_method: String,
    pub cancel_method: String,
    pub status: TransactionStatus,
}

/// Data for TccTransactionEndedEvent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TccEndedData {
    pub meta: EventMeta,
    pub status: TransactionStatus,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(meta: EventMeta, timeout: u32) -> Self {
        SagaEvent::SagaStartedEvent(SagaStartedData { meta, timeout })
    }

    pub fn saga_ended(meta: EventMeta) -> Self {
        SagaEvent::SagaEndedEvent(EventData { meta })
    }

    pub fn saga_aborted(meta: EventMeta, payloads: Vec<u8>) -> Self {
        SagaEvent::SagaAbortedEvent(AbortedData { meta, payloads })
    }

    pub fn tx_started(
        meta: EventMeta,
        compensation_method: impl Into<String>,
        payloads: Vec<u8>,
    ) -> Self {
        SagaEvent::TxStartedEvent(TxStartedData {
            meta,
            compensation_method: compensation_method.into(),
            payloads,
            timeout: 0,
            retry_method: String::new(),
            retries: 0,
        })
    }

    pub fn tx_ended(meta: EventMeta) -> Self {
        SagaEvent::TxEndedEvent(EventData { meta })
    }

    pub fn tx_aborted(meta: EventMeta, payloads: Vec<u8>) -> Self {
        SagaEvent::TxAbortedEvent(AbortedData { meta, payloads })
    }

    pub fn tx_compensated(meta: EventMeta) -> Self {
        SagaEvent::TxCompensatedEvent(EventData { meta })
    }

    /// Returns true for the event that creates a global transaction.
    pub fn is_start(&self) -> bool {
        matches!(self, SagaEvent::SagaStartedEvent(_))
    }
}

impl TccEvent {
    pub fn participated(
        meta: EventMeta,
        confirm_method: impl Into<String>,
        cancel_method: impl Into<String>,
        status: TransactionStatus,
    ) -> Self {
        TccEvent::ParticipatedEvent(ParticipatedData {
            meta,
            confirm_method: confirm_method.into(),
            cancel_method: cancel_method.into(),
            status,
        })
    }

    pub fn transaction_started(meta: EventMeta) -> Self {
        TccEvent::TccTransactionStartedEvent(EventData { meta })
    }

    pub fn transaction_ended(meta: EventMeta, status: TransactionStatus) -> Self {
        TccEvent::TccTransactionEndedEvent(TccEndedData { meta, status })
    }
}
