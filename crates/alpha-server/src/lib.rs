//! Saga/TCC coordinator server.
//!
//! Wires the coordinators to storage, leadership and the participant
//! channels, and exposes an HTTP API for event ingestion and operators,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod discovery;
pub mod error;
pub mod omega;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use callback::{CallbackRegistry, Dispatcher};
use cluster::{LeaderElection, LeaderGate};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::SagaCoordinator;
use tcc::TccCoordinator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use discovery::DiscoveryMetadata;
use omega::OmegaService;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub omega: OmegaService,
    pub gate: LeaderGate,
    /// Present when cluster mode is enabled.
    pub election: Option<Arc<LeaderElection>>,
    pub instance_id: String,
    pub discovery: Arc<DiscoveryMetadata>,
}

impl AppState {
    /// Builds the coordinators over `store`, acting only while `gate` is
    /// active.
    pub fn new(
        config: &Config,
        store: Arc<dyn EventStore>,
        gate: LeaderGate,
        election: Option<Arc<LeaderElection>>,
    ) -> Self {
        let registry = CallbackRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone(), config.retry_policy());
        let saga = SagaCoordinator::new(
            store.clone(),
            dispatcher.clone(),
            gate.clone(),
            config.saga_config(),
        );
        let tcc = TccCoordinator::new(store.clone(), dispatcher, gate.clone());

        Self {
            store,
            omega: OmegaService::new(registry, saga, tcc, config.ack_timeout),
            gate,
            election,
            instance_id: config.instance_id.clone(),
            discovery: Arc::new(DiscoveryMetadata::from_address(
                config.discovery_address.clone(),
            )),
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health))
        .route("/events", post(routes::events::ingest))
        .route(
            "/omega/{service}/{instance}",
            delete(routes::participants::disconnect),
        )
        .route(
            "/omega/{service}/{instance}/commands",
            get(routes::participants::commands),
        )
        .route(
            "/omega/{service}/{instance}/acks",
            post(routes::participants::ack),
        )
        .route("/transactions", get(routes::transactions::list))
        .route("/transactions/{id}", get(routes::transactions::get))
        .route("/transactions/{id}/events", get(routes::transactions::events))
        .route("/tcc/{id}/participants", get(routes::tcc::participants))
        .route("/cluster/leader", get(routes::cluster::leader))
        .route(
            "/undeliverable",
            get(routes::undeliverable::list).delete(routes::undeliverable::drain),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Rebuilds coordinator state every time this instance gains leadership.
///
/// Returns once the gate's election is gone.
pub async fn watch_leadership(omega: OmegaService, mut gate: LeaderGate) {
    while let Some(active) = gate.changed().await {
        if !active {
            continue;
        }
        if let Err(e) = omega.on_leadership_gained().await {
            tracing::error!(error = %e, "failed to rebuild state after gaining leadership");
        }
    }
}
