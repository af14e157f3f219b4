//! TCC participant queries.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::GlobalTxId;
use serde::Serialize;
use tcc::ParticipationRecord;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct ParticipantResponse {
    pub local_tx_id: String,
    pub parent_tx_id: Option<String>,
    pub service_name: String,
    pub instance_id: String,
    pub confirm_method: String,
    pub cancel_method: String,
    pub status: String,
    pub participated_at: DateTime<Utc>,
    /// Whether the participant currently has a live command channel.
    pub connected: bool,
}

impl ParticipantResponse {
    pub fn new(record: &ParticipationRecord, state: &AppState) -> Self {
        Self {
            local_tx_id: record.local_tx_id.to_string(),
            parent_tx_id: record.parent_tx_id.as_ref().map(ToString::to_string),
            service_name: record.service_name.clone(),
            instance_id: record.instance_id.clone(),
            confirm_method: record.confirm_method.clone(),
            cancel_method: record.cancel_method.clone(),
            status: record.status.to_string(),
            participated_at: record.participated_at,
            connected: state
                .omega
                .registry()
                .retrieve(&record.target())
                .is_some(),
        }
    }
}

/// GET /tcc/{id}/participants — participants registered for a transaction.
#[tracing::instrument(skip(state))]
pub async fn participants(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ParticipantResponse>>, ApiError> {
    let records = state
        .omega
        .tcc()
        .participants(&GlobalTxId::from(id.as_str()))
        .await?;
    if records.is_empty() {
        return Err(ApiError::NotFound(format!("TCC transaction {id} not found")));
    }

    Ok(Json(
        records
            .iter()
            .map(|r| ParticipantResponse::new(r, &state))
            .collect(),
    ))
}
