//! Leadership status.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct LeaderResponse {
    pub instance_id: String,
    /// Whether this instance coordinates transactions right now.
    pub active: bool,
    pub cluster_enabled: bool,
    pub leader: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Address published for service discovery.
    pub address: Option<String>,
}

/// GET /cluster/leader — this instance's role and the current lease holder.
#[tracing::instrument(skip(state))]
pub async fn leader(State(state): State<Arc<AppState>>) -> Result<Json<LeaderResponse>, ApiError> {
    let lease = match &state.election {
        Some(election) => election.current_leader().await?,
        None => None,
    };
    let active = state.gate.is_active();

    // Without an election an always-active instance is its own leader.
    let leader = match (&lease, &state.election) {
        (Some(lock), _) => Some(lock.instance_id.clone()),
        (None, None) if active => Some(state.instance_id.clone()),
        (None, _) => None,
    };

    Ok(Json(LeaderResponse {
        instance_id: state.instance_id.clone(),
        active,
        cluster_enabled: state.election.is_some(),
        leader,
        lease_expires_at: lease.map(|l| l.expire_time),
        address: state.discovery.address(),
    }))
}
