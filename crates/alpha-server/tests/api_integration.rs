//! Integration tests for the coordinator HTTP API.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use alpha_server::AppState;
use alpha_server::config::Config;
use axum::body::{Body, BodyDataStream};
use axum::http::{Request, StatusCode};
use cluster::{ElectionConfig, InMemoryLockStore, LeaderElection, LeaderGate};
use common::ServiceConfig;
use domain::{Ack, Command};
use event_store::InMemoryEventStore;
use futures_util::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn test_config() -> Config {
    Config {
        instance_id: "alpha-test".to_string(),
        dispatch_max_attempts: 2,
        dispatch_backoff: Duration::from_millis(5),
        dispatch_max_backoff: Duration::from_millis(10),
        ack_timeout: Duration::from_secs(1),
        ..Config::default()
    }
}

fn setup_with_state() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(
        &test_config(),
        Arc::new(InMemoryEventStore::new()),
        LeaderGate::always_active(),
        None,
    ));
    let app = alpha_server::create_app(state.clone(), get_metrics_handle());
    (app, state)
}

fn setup() -> axum::Router {
    setup_with_state().0
}

fn wire(event_type: &str, gid: &str, local: &str) -> serde_json::Value {
    serde_json::json!({
        "serviceName": "booking",
        "instanceId": "booking-1",
        "globalTxId": gid,
        "localTxId": local,
        "parentTxId": gid,
        "type": event_type,
        "compensationMethod": format!("cancel_{local}"),
        "confirmMethod": format!("confirm_{local}"),
        "cancelMethod": format!("cancel_{local}"),
        "status": "Succeed",
    })
}

async fn post_event(app: &axum::Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/events")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or_default())
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or_default())
}

async fn send_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn open_commands(app: &axum::Router, service: &str, instance: &str) -> BodyDataStream {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/omega/{service}/{instance}/commands"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    response.into_body().into_data_stream()
}

/// Reads server-sent frames until one carries a command.
async fn next_command(commands: &mut BodyDataStream) -> serde_json::Value {
    let mut buffer = String::new();
    loop {
        let chunk = tokio::time::timeout(Duration::from_secs(2), commands.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        if !buffer.contains("\n\n") {
            continue;
        }
        if let Some(data) = buffer
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
        {
            return serde_json::from_str(data.trim_start()).unwrap();
        }
        buffer.clear();
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = setup();

    let (status, json) = get_json(&app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["active"], true);
    assert_eq!(json["connected_participants"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_committed_saga_is_queryable() {
    let app = setup();

    for (event_type, local) in [
        ("SagaStartedEvent", ""),
        ("TxStartedEvent", "l1"),
        ("TxEndedEvent", "l1"),
        ("TxStartedEvent", "l2"),
        ("TxEndedEvent", "l2"),
        ("SagaEndedEvent", ""),
    ] {
        let (status, ack) = post_event(&app, wire(event_type, "g1", local)).await;
        assert_eq!(status, StatusCode::OK, "{event_type}");
        assert_eq!(ack["aborted"], false);
    }

    let (status, tx) = get_json(&app, "/transactions/g1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tx["transaction_type"], "SAGA");
    assert_eq!(tx["state"], "COMMITTED");
    let subs = tx["sub_transactions"].as_array().unwrap();
    assert_eq!(subs.len(), 2);
    assert!(subs.iter().all(|s| s["status"] == "Succeed"));

    let (status, events) = get_json(&app, "/transactions/g1/events").await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 6);
    assert_eq!(events[0]["event_type"], "SagaStartedEvent");
    assert_eq!(events[0]["version"], 1);
    assert_eq!(events[2]["local_tx_id"], "l1");
    assert!(events.iter().all(|e| e["outcome"] == "applied"));

    let (_, committed) = get_json(&app, "/transactions?state=COMMITTED").await;
    assert_eq!(committed.as_array().unwrap().len(), 1);
    let (_, suspended) = get_json(&app, "/transactions?state=SUSPENDED").await;
    assert!(suspended.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_abort_compensates_connected_participant() {
    let (app, state) = setup_with_state();
    let mut connection = state
        .omega
        .on_connected(ServiceConfig::new("booking", "booking-1"));

    for (event_type, local) in [
        ("SagaStartedEvent", ""),
        ("TxStartedEvent", "l1"),
        ("TxEndedEvent", "l1"),
        ("TxStartedEvent", "l2"),
        ("TxAbortedEvent", "l2"),
        ("SagaAbortedEvent", ""),
    ] {
        let (status, _) = post_event(&app, wire(event_type, "g1", local)).await;
        assert_eq!(status, StatusCode::OK, "{event_type}");
    }

    let pending = tokio::time::timeout(Duration::from_secs(2), connection.recv())
        .await
        .unwrap()
        .unwrap();
    let Command::Compensate(command) = pending.command().clone() else {
        panic!("expected a compensation");
    };
    assert_eq!(command.local_tx_id.as_str(), "l1");
    assert_eq!(command.compensation_method, "cancel_l1");
    pending.ack(Ack::ok());

    let (_, tx) = get_json(&app, "/transactions/g1").await;
    assert_eq!(tx["state"], "COMPENSATING");

    let (status, _) = post_event(&app, wire("TxCompensatedEvent", "g1", "l1")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, tx) = get_json(&app, "/transactions/g1").await;
    assert_eq!(tx["state"], "COMPENSATED");
}

#[tokio::test]
async fn test_tcc_participants_and_decision() {
    let (app, state) = setup_with_state();
    let mut connection = state
        .omega
        .on_connected(ServiceConfig::new("booking", "booking-1"));

    post_event(&app, wire("ParticipatedEvent", "g2", "l1")).await;
    post_event(&app, wire("TccTransactionStartedEvent", "g2", "l1")).await;

    let (status, participants) = get_json(&app, "/tcc/g2/participants").await;
    assert_eq!(status, StatusCode::OK);
    let participants = participants.as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["cancel_method"], "cancel_l1");
    assert_eq!(participants[0]["connected"], true);

    let mut end = wire("TccTransactionEndedEvent", "g2", "l1");
    end["status"] = serde_json::json!("Failed");
    let (status, _) = post_event(&app, end).await;
    assert_eq!(status, StatusCode::OK);

    let pending = tokio::time::timeout(Duration::from_secs(2), connection.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.command().method(), "cancel_l1");
    pending.ack(Ack::ok());

    let (_, tx) = get_json(&app, "/transactions/g2").await;
    assert_eq!(tx["transaction_type"], "TCC");
    assert_eq!(tx["state"], "CANCELLED");
    assert_eq!(tx["coordination"], "Cancel");
}

#[tokio::test]
async fn test_illegal_event_returns_conflict() {
    let app = setup();

    post_event(&app, wire("SagaStartedEvent", "g3", "")).await;
    let (status, body) = post_event(&app, wire("TxEndedEvent", "g3", "l9")).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("TxEndedEvent"));

    // Still recorded for audit.
    let (_, events) = get_json(&app, "/transactions/g3/events").await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["outcome"], "illegal");
}

#[tokio::test]
async fn test_orphan_event_returns_conflict() {
    let app = setup();

    let (status, _) = post_event(&app, wire("TxStartedEvent", "g4", "l1")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = get_json(&app, "/transactions/g4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_event_type_is_bad_request() {
    let app = setup();

    let (status, body) = post_event(&app, wire("TxRetriedEvent", "g5", "l1")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("TxRetriedEvent"));
}

#[tokio::test]
async fn test_get_nonexistent_transaction() {
    let app = setup();

    let (status, _) = get_json(&app, "/transactions/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&app, "/transactions/missing/events").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&app, "/tcc/missing/participants").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_standby_refuses_events() {
    let election = Arc::new(LeaderElection::new(
        Arc::new(InMemoryLockStore::new()),
        ElectionConfig::new("servicecomb-alpha-server", "alpha-test"),
    ));
    let state = Arc::new(AppState::new(
        &test_config(),
        Arc::new(InMemoryEventStore::new()),
        election.gate(),
        Some(election),
    ));
    let app = alpha_server::create_app(state, get_metrics_handle());

    let (status, _) = post_event(&app, wire("SagaStartedEvent", "g6", "")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, leader) = get_json(&app, "/cluster/leader").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(leader["active"], false);
    assert_eq!(leader["cluster_enabled"], true);
    assert!(leader["leader"].is_null());
}

#[tokio::test]
async fn test_cluster_leader_after_acquiring_lease() {
    let election = Arc::new(LeaderElection::new(
        Arc::new(InMemoryLockStore::new()),
        ElectionConfig::new("servicecomb-alpha-server", "alpha-test"),
    ));
    assert!(election.try_acquire_or_renew().await);

    let state = Arc::new(AppState::new(
        &test_config(),
        Arc::new(InMemoryEventStore::new()),
        election.gate(),
        Some(election),
    ));
    let app = alpha_server::create_app(state, get_metrics_handle());

    let (_, leader) = get_json(&app, "/cluster/leader").await;
    assert_eq!(leader["active"], true);
    assert_eq!(leader["leader"], "alpha-test");
    assert!(leader["lease_expires_at"].is_string());

    let (status, _) = post_event(&app, wire("SagaStartedEvent", "g7", "")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_single_instance_is_its_own_leader() {
    let app = setup();

    let (_, leader) = get_json(&app, "/cluster/leader").await;

    assert_eq!(leader["active"], true);
    assert_eq!(leader["cluster_enabled"], false);
    assert_eq!(leader["leader"], "alpha-test");
}

#[tokio::test]
async fn test_transaction_events_can_be_filtered() {
    let app = setup();

    for (event_type, local) in [
        ("SagaStartedEvent", ""),
        ("TxStartedEvent", "l1"),
        ("TxEndedEvent", "l1"),
        ("TxStartedEvent", "l2"),
        ("TxEndedEvent", "l2"),
        ("SagaEndedEvent", ""),
    ] {
        post_event(&app, wire(event_type, "g8", local)).await;
    }

    let (status, events) =
        get_json(&app, "/transactions/g8/events?type=TxStartedEvent,TxEndedEvent").await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e["event_type"] != "SagaStartedEvent"));

    let (_, events) = get_json(&app, "/transactions/g8/events?from_version=2&to_version=3").await;
    let versions: Vec<_> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, [2, 3]);

    let (_, events) = get_json(&app, "/transactions/g8/events?limit=2&offset=4").await;
    let versions: Vec<_> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, [5, 6]);

    // A known transaction with no matching events is an empty page.
    let (status, events) = get_json(&app, "/transactions/g8/events?type=SagaAbortedEvent").await;
    assert_eq!(status, StatusCode::OK);
    assert!(events.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_command_stream_delivers_and_acks_compensation() {
    let app = setup();
    let mut commands = open_commands(&app, "booking", "booking-1").await;

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["connected_participants"], 1);

    for (event_type, local) in [
        ("SagaStartedEvent", ""),
        ("TxStartedEvent", "l1"),
        ("TxEndedEvent", "l1"),
        ("TxStartedEvent", "l2"),
        ("TxAbortedEvent", "l2"),
    ] {
        let (status, _) = post_event(&app, wire(event_type, "g9", local)).await;
        assert_eq!(status, StatusCode::OK, "{event_type}");
    }

    let command = next_command(&mut commands).await;
    assert_eq!(command["kind"], "compensate");
    assert_eq!(command["global_tx_id"], "g9");
    assert_eq!(command["local_tx_id"], "l1");
    assert_eq!(command["compensation_method"], "cancel_l1");

    let ack = serde_json::json!({ "globalTxId": "g9", "localTxId": "l1" });
    let status = send_json(&app, "POST", "/omega/booking/booking-1/acks", ack.clone()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let status = send_json(&app, "POST", "/omega/booking/booking-1/acks", ack).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_event(&app, wire("TxCompensatedEvent", "g9", "l1")).await;
    assert_eq!(status, StatusCode::OK);
    let (_, tx) = get_json(&app, "/transactions/g9").await;
    assert_eq!(tx["state"], "COMPENSATED");

    // Closing the stream disconnects the participant.
    drop(commands);
    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["connected_participants"], 0);
}

#[tokio::test]
async fn test_reconnect_survives_old_stream_closing() {
    let app = setup();
    let first = open_commands(&app, "booking", "booking-1").await;
    let second = open_commands(&app, "booking", "booking-1").await;

    drop(first);
    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["connected_participants"], 1);

    drop(second);
    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["connected_participants"], 0);
}

#[tokio::test]
async fn test_disconnect_route_ends_command_stream() {
    let app = setup();
    let mut commands = open_commands(&app, "booking", "booking-1").await;

    let status = send_json(&app, "DELETE", "/omega/booking/booking-1", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let ended = tokio::time::timeout(Duration::from_secs(2), commands.next())
        .await
        .unwrap();
    assert!(ended.is_none());

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["connected_participants"], 0);
    let status = send_json(&app, "DELETE", "/omega/booking/booking-1", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_undeliverable_report_can_be_drained() {
    let app = setup();

    post_event(&app, wire("ParticipatedEvent", "g10", "l1")).await;
    let (status, _) = post_event(&app, wire("TccTransactionEndedEvent", "g10", "l1")).await;
    assert_eq!(status, StatusCode::OK);

    let mut report = serde_json::Value::Null;
    for _ in 0..200 {
        let (_, body) = get_json(&app, "/undeliverable").await;
        if body.as_array().is_some_and(|entries| !entries.is_empty()) {
            report = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entries = report.as_array().expect("command never reported undeliverable");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["command"]["method"], "confirm_l1");
    assert_eq!(entries[0]["target"]["instance_id"], "booking-1");
    assert_eq!(entries[0]["attempts"], 2);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/undeliverable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let drained: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(drained.as_array().unwrap().len(), 1);

    let (_, report) = get_json(&app, "/undeliverable").await;
    assert!(report.as_array().unwrap().is_empty());
}
