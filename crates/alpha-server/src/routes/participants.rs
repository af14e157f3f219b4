//! Participant command channels over server-sent events.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use common::{GlobalTxId, LocalTxId, ServiceConfig};
use domain::Ack;
use futures_util::stream::{self, Stream};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

/// Outcome of one streamed command, reported by the participant.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    pub global_tx_id: String,
    pub local_tx_id: String,
    #[serde(default)]
    pub aborted: bool,
}

/// GET /omega/{service}/{instance}/commands — connects the participant and
/// streams its commands as `command` events.
///
/// The participant stays connected while the stream is open.
#[tracing::instrument(skip(state))]
pub async fn commands(
    State(state): State<Arc<AppState>>,
    Path((service, instance)): Path<(String, String)>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let feed = state
        .omega
        .open_stream(ServiceConfig::new(service, instance));

    let events = stream::unfold(feed, |mut feed| async move {
        let command = feed.next().await?;
        tracing::debug!(
            participant = %feed.target(),
            global_tx_id = %command.global_tx_id(),
            method = command.method(),
            "command streamed"
        );
        Some((Event::default().event("command").json_data(&command), feed))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// POST /omega/{service}/{instance}/acks — completes a streamed command.
#[tracing::instrument(skip(state, request))]
pub async fn ack(
    State(state): State<Arc<AppState>>,
    Path((service, instance)): Path<(String, String)>,
    Json(request): Json<AckRequest>,
) -> Result<StatusCode, ApiError> {
    let ack = if request.aborted {
        Ack::aborted()
    } else {
        Ack::ok()
    };
    let acked = state.omega.ack_command(
        &ServiceConfig::new(service, instance),
        &GlobalTxId::from(request.global_tx_id.as_str()),
        &LocalTxId::from(request.local_tx_id.as_str()),
        ack,
    );
    if !acked {
        return Err(ApiError::NotFound(format!(
            "No command awaiting ack for {}",
            request.local_tx_id
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /omega/{service}/{instance} — drops the participant's channel.
#[tracing::instrument(skip(state))]
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path((service, instance)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let config = ServiceConfig::new(service, instance);
    if !state.omega.on_disconnected(&config) {
        return Err(ApiError::NotFound(format!("Participant {config} not connected")));
    }
    Ok(StatusCode::NO_CONTENT)
}
