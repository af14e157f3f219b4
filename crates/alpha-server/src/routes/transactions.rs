//! Transaction queries for operators.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use common::GlobalTxId;
use domain::{Coordination, TransactionStatus};
use event_store::{EventQuery, Version};
use saga::{CompensationStatus, GlobalTransaction, SubTransaction};
use serde::{Deserialize, Serialize};
use tcc::TccTransaction;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::tcc::ParticipantResponse;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Only transactions in this state, e.g. `SUSPENDED`.
    pub state: Option<String>,
}

/// Filters for a transaction's audit log.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types, e.g. `TxStartedEvent,TxAbortedEvent`.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub from_version: Option<i64>,
    pub to_version: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EventsQuery {
    fn into_event_query(self, global_tx_id: GlobalTxId) -> EventQuery {
        let mut query = EventQuery::for_transaction(global_tx_id);
        if let Some(types) = self.event_type {
            query = query.event_types(
                types
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Some(from) = self.from_version {
            query = query.from_version(Version::new(from));
        }
        if let Some(to) = self.to_version {
            query = query.to_version(Version::new(to));
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = self.offset {
            query = query.offset(offset);
        }
        query
    }
}

#[derive(Serialize)]
pub struct TransactionSummaryResponse {
    pub global_tx_id: String,
    pub transaction_type: String,
    pub state: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct SubTransactionResponse {
    pub local_tx_id: String,
    pub parent_tx_id: Option<String>,
    pub service_name: String,
    pub instance_id: String,
    pub compensation_method: String,
    pub status: TransactionStatus,
    pub compensation: CompensationStatus,
    pub started_at: DateTime<Utc>,
}

impl From<&SubTransaction> for SubTransactionResponse {
    fn from(sub: &SubTransaction) -> Self {
        Self {
            local_tx_id: sub.local_tx_id.to_string(),
            parent_tx_id: sub.parent_tx_id.as_ref().map(ToString::to_string),
            service_name: sub.service_name.clone(),
            instance_id: sub.instance_id.clone(),
            compensation_method: sub.compensation_method.clone(),
            status: sub.status,
            compensation: sub.compensation,
            started_at: sub.started_at,
        }
    }
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub global_tx_id: String,
    pub state: String,
    pub service_name: String,
    pub instance_id: String,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub timeout: u32,
    pub suspension_reason: Option<String>,
    pub sub_transactions: Vec<SubTransactionResponse>,
}

impl From<GlobalTransaction> for SagaResponse {
    fn from(tx: GlobalTransaction) -> Self {
        Self {
            global_tx_id: tx.global_tx_id().to_string(),
            state: tx.state().to_string(),
            service_name: tx.service_name().to_string(),
            instance_id: tx.instance_id().to_string(),
            begin_time: tx.begin_time(),
            end_time: tx.end_time(),
            duration_ms: tx.duration().map(|d| d.num_milliseconds()),
            timeout: tx.timeout(),
            suspension_reason: tx.suspension_reason().map(String::from),
            sub_transactions: tx.sub_transactions().iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct TccResponse {
    pub global_tx_id: String,
    pub state: String,
    pub coordination: Option<Coordination>,
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: Vec<ParticipantResponse>,
}

impl TccResponse {
    fn new(tx: TccTransaction, state: &AppState) -> Self {
        Self {
            global_tx_id: tx.global_tx_id().to_string(),
            state: tx.state_name().to_string(),
            coordination: tx.coordination(),
            ended_at: tx.ended_at(),
            participants: tx
                .participants()
                .iter()
                .map(|p| ParticipantResponse::new(p, state))
                .collect(),
        }
    }
}

/// A saga or TCC transaction, tagged by type.
#[derive(Serialize)]
#[serde(tag = "transaction_type")]
pub enum TransactionResponse {
    #[serde(rename = "SAGA")]
    Saga(SagaResponse),
    #[serde(rename = "TCC")]
    Tcc(TccResponse),
}

#[derive(Serialize)]
pub struct EventResponse {
    pub event_id: String,
    pub event_type: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub local_tx_id: Option<String>,
    pub service_name: Option<String>,
    /// How the coordinator handled the event, e.g. `applied` or `illegal`.
    pub outcome: Option<String>,
    pub payload: serde_json::Value,
}

/// GET /transactions — list transaction summaries, optionally by state.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransactionSummaryResponse>>, ApiError> {
    let snapshots = state.store.list_snapshots(query.state.as_deref()).await?;

    Ok(Json(
        snapshots
            .into_iter()
            .map(|s| TransactionSummaryResponse {
                global_tx_id: s.global_tx_id.to_string(),
                transaction_type: s.transaction_type,
                state: s.state,
                version: s.version.as_i64(),
                updated_at: s.updated_at,
            })
            .collect(),
    ))
}

/// GET /transactions/{id} — current view of one transaction.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let global_tx_id = GlobalTxId::from(id.as_str());

    if let Some(tx) = state.omega.saga().transaction(&global_tx_id).await? {
        return Ok(Json(TransactionResponse::Saga(tx.into())));
    }
    if let Some(tx) = state.omega.tcc().transaction(&global_tx_id).await? {
        return Ok(Json(TransactionResponse::Tcc(TccResponse::new(tx, &state))));
    }
    Err(ApiError::NotFound(format!("Transaction {id} not found")))
}

/// GET /transactions/{id}/events — the transaction's audit log.
///
/// Filters by `type`, `from_version` and `to_version`, and pages with
/// `limit` and `offset`.
#[tracing::instrument(skip(state))]
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventResponse>>, ApiError> {
    let global_tx_id = GlobalTxId::from(id.as_str());
    let envelopes = state
        .store
        .query_events(query.into_event_query(global_tx_id.clone()))
        .await?;
    if envelopes.is_empty() && state.store.get_transaction_version(&global_tx_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Transaction {id} not found")));
    }

    Ok(Json(
        envelopes
            .into_iter()
            .map(|e| EventResponse {
                event_id: e.event_id.to_string(),
                local_tx_id: e.metadata_str("local_tx_id").map(String::from),
                service_name: e.metadata_str("service_name").map(String::from),
                outcome: e.metadata_str("outcome").map(String::from),
                event_type: e.event_type,
                version: e.version.as_i64(),
                timestamp: e.timestamp,
                payload: e.payload,
            })
            .collect(),
    ))
}
