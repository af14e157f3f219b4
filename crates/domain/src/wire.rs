//! Flat inbound message format and its conversion into typed events.

use chrono::{DateTime, Utc};
use common::{GlobalTxId, LocalTxId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::{
    AbortedData, EventData, EventMeta, ParticipatedData, SagaEvent, SagaStartedData, TccEndedData,
    TccEvent, TxStartedData,
};
use crate::status::TransactionStatus;

/// One lifecycle message as a participant sends it.
///
/// Every field is present on every message; which ones matter depends on
/// `type`. Empty strings stand for absent values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireTxEvent {
    pub service_name: String,
    pub instance_id: String,
    /// Milliseconds since the Unix epoch; 0 means "now".
    pub timestamp: i64,
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub parent_tx_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub compensation_method: String,
    pub confirm_method: String,
    pub cancel_method: String,
    pub payloads: Vec<u8>,
    pub timeout: u32,
    pub retry_method: String,
    pub retries: u32,
    pub status: String,
}

/// A decoded inbound message, routed by protocol.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Saga(SagaEvent),
    Tcc(TccEvent),
}

impl WireTxEvent {
    fn meta(&self, local_required: bool) -> Result<EventMeta, DomainError> {
        if self.global_tx_id.is_empty() {
            return Err(DomainError::MissingField("globalTxId"));
        }
        let local_tx_id = if self.local_tx_id.is_empty() {
            if local_required {
                return Err(DomainError::MissingField("localTxId"));
            }
            LocalTxId::from(self.global_tx_id.as_str())
        } else {
            LocalTxId::from(self.local_tx_id.as_str())
        };

        let timestamp = if self.timestamp == 0 {
            Utc::now()
        } else {
            DateTime::from_timestamp_millis(self.timestamp)
                .ok_or(DomainError::InvalidTimestamp(self.timestamp))?
        };

        Ok(EventMeta {
            service_name: self.service_name.clone(),
            instance_id: self.instance_id.clone(),
            timestamp,
            global_tx_id: GlobalTxId::from(self.global_tx_id.as_str()),
            local_tx_id,
            parent_tx_id: (!self.parent_tx_id.is_empty())
                .then(|| LocalTxId::from(self.parent_tx_id.as_str())),
        })
    }
}

impl TryFrom<WireTxEvent> for InboundEvent {
    type Error = DomainError;

    fn try_from(wire: WireTxEvent) -> Result<Self, Self::Error> {
        let event = match wire.event_type.as_str() {
            "SagaStartedEvent" => InboundEvent::Saga(SagaEvent::SagaStartedEvent(SagaStartedData {
                meta: wire.meta(false)?,
                timeout: wire.timeout,
            })),
            "SagaEndedEvent" => InboundEvent::Saga(SagaEvent::SagaEndedEvent(EventData {
                meta: wire.meta(false)?,
            })),
            "SagaAbortedEvent" => InboundEvent::Saga(SagaEvent::SagaAbortedEvent(AbortedData {
                meta: wire.meta(false)?,
                payloads: wire.payloads,
            })),
            "TxStartedEvent" => InboundEvent::Saga(SagaEvent::TxStartedEvent(TxStartedData {
                meta: wire.meta(true)?,
                compensation_method: wire.compensation_method,
                payloads: wire.payloads,
                timeout: wire.timeout,
                retry_method: wire.retry_method,
                retries: wire.retries,
            })),
            "TxEndedEvent" => InboundEvent::Saga(SagaEvent::TxEndedEvent(EventData {
                meta: wire.meta(true)?,
            })),
            "TxAbortedEvent" => InboundEvent::Saga(SagaEvent::TxAbortedEvent(AbortedData {
                meta: wire.meta(true)?,
                payloads: wire.payloads,
            })),
            "TxCompensatedEvent" => InboundEvent::Saga(SagaEvent::TxCompensatedEvent(EventData {
                meta: wire.meta(true)?,
            })),
            "ParticipatedEvent" => InboundEvent::Tcc(TccEvent::ParticipatedEvent(ParticipatedData {
                meta: wire.meta(true)?,
                status: TransactionStatus::from_wire(&wire.status),
                confirm_method: wire.confirm_method,
                cancel_method: wire.cancel_method,
            })),
            "TccTransactionStartedEvent" => {
                InboundEvent::Tcc(TccEvent::TccTransactionStartedEvent(EventData {
                    meta: wire.meta(false)?,
                }))
            }
            "TccTransactionEndedEvent" => {
                InboundEvent::Tcc(TccEvent::TccTransactionEndedEvent(TccEndedData {
                    meta: wire.meta(false)?,
                    status: TransactionStatus::from_wire(&wire.status),
                }))
            }
            other => return Err(DomainError::UnknownEventType(other.to_string())),
        };
        Ok(event)
    }
}
