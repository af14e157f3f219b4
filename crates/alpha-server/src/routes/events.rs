//! Wire event ingestion.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use domain::WireTxEvent;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct AckResponse {
    pub aborted: bool,
}

/// POST /events — hand one participant message to the coordinators.
#[tracing::instrument(skip(state, event))]
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(event): Json<WireTxEvent>,
) -> Result<Json<AckResponse>, ApiError> {
    let ack = state.omega.on_tx_event(event).await?;
    Ok(Json(AckResponse {
        aborted: ack.aborted,
    }))
}
