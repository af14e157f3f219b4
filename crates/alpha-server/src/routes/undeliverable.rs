//! Operator view of commands that ran out of delivery attempts.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use callback::UndeliverableCommand;

use crate::AppState;

/// GET /undeliverable — most recent undeliverable commands, oldest first.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<UndeliverableCommand>> {
    Json(state.omega.saga().dispatcher().undeliverable())
}

/// DELETE /undeliverable — returns the report and clears it.
#[tracing::instrument(skip(state))]
pub async fn drain(State(state): State<Arc<AppState>>) -> Json<Vec<UndeliverableCommand>> {
    let drained = state.omega.saga().dispatcher().drain_undeliverable();
    tracing::info!(count = drained.len(), "undeliverable report drained");
    Json(drained)
}
