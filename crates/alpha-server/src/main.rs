//! Coordinator server entry point.

use std::sync::Arc;

use alpha_server::AppState;
use alpha_server::config::Config;
use alpha_server::discovery::ListenerStartedListener;
use cluster::{InMemoryLockStore, LeaderElection, LeaderGate, LockStore, PostgresLockStore};
use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Opens the event and lease stores: PostgreSQL when configured, memory
/// otherwise.
async fn open_stores(config: &Config) -> (Arc<dyn EventStore>, Arc<dyn LockStore>) {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return (
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryLockStore::new()),
        );
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to database");
    let event_store = PostgresEventStore::new(pool.clone());
    event_store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    tracing::info!("connected to PostgreSQL");

    (
        Arc::new(event_store),
        Arc::new(PostgresLockStore::new(pool)),
    )
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Storage and leadership
    let (event_store, lock_store) = open_stores(&config).await;
    let election = config
        .cluster_enabled
        .then(|| Arc::new(LeaderElection::new(lock_store, config.election_config())));
    let gate = election
        .as_ref()
        .map(|e| e.gate())
        .unwrap_or_else(LeaderGate::always_active);

    let state = Arc::new(AppState::new(
        &config,
        event_store,
        gate.clone(),
        election.clone(),
    ));

    // 4. Start coordinating
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(alpha_server::watch_leadership(state.omega.clone(), gate));
    let election_task = match &election {
        Some(election) => {
            let election = election.clone();
            Some(tokio::spawn(async move { election.run(shutdown_rx).await }))
        }
        None => {
            if let Err(e) = state.omega.on_leadership_gained().await {
                tracing::error!(error = %e, "failed to recover in-flight sagas");
            }
            None
        }
    };

    // 5. Bind and announce the listener
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    let port = listener
        .local_addr()
        .expect("failed to read bound address")
        .port();
    tracing::info!(%addr, port, instance_id = %config.instance_id, "listener started");
    let listeners: Vec<Arc<dyn ListenerStartedListener>> = vec![state.discovery.clone()];
    for l in &listeners {
        l.on_listener_started(port);
    }

    // 6. Serve until shutdown
    let app = alpha_server::create_app(state, metrics_handle);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Release the lease so a standby can take over immediately.
    let _ = shutdown_tx.send(true);
    if let Some(task) = election_task
        && let Err(e) = task.await
    {
        tracing::error!(error = %e, "leader election task failed");
    }

    tracing::info!("server shut down gracefully");
}
