#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! HTTP endpoints through `tower::ServiceExt::oneshot` and the observer
//! WebSocket protocol against a server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use foreman_core::{Config, NewFeature};
use foreman_daemon::broadcast::EventHub;
use foreman_daemon::broadcast::events::{FeatureOutcome, ObserverEvent};
use foreman_daemon::orchestration::Orchestrator;
use foreman_daemon::server::{AppState, ObserverSettings, router};
use foreman_daemon::storage::Database;
use foreman_daemon::subprocess::{Assignment, SubprocessError, WorkerHandle, WorkerLauncher};

struct NoWorkers;

impl WorkerLauncher for NoWorkers {
    fn launch(&self, _assignment: &Assignment) -> Result<WorkerHandle, SubprocessError> {
        Err(SubprocessError::SpawnFailed {
            reason: "no workers in this test".to_string(),
        })
    }
}

async fn orchestrator() -> Orchestrator {
    let store = Database::open_in_memory().await.unwrap();
    Orchestrator::new(
        store,
        EventHub::with_defaults(),
        Arc::new(NoWorkers),
        &Config::default(),
    )
}

fn app(orchestrator: &Orchestrator) -> axum::Router {
    router(AppState {
        orchestrator: orchestrator.clone(),
        observers: ObserverSettings::default(),
    })
}

/// Send a request and return (status, JSON body).
async fn send(
    orchestrator: &Orchestrator,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let resp = app(orchestrator)
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_store_and_slots() {
    let orch = orchestrator().await;
    let (status, body) = send(&orch, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], true);
    assert_eq!(body["run_status"], "stopped");
    assert_eq!(body["active_primary"], 0);
}

#[tokio::test]
async fn create_list_and_fetch_features() {
    let orch = orchestrator().await;
    let (status, body) = send(
        &orch,
        "POST",
        "/api/features",
        Some(serde_json::json!([
            {"category": "auth", "name": "login", "steps": ["open page", "submit"], "priority": 1},
            {"name": "logout", "dependencies": [1]}
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ids"], serde_json::json!([1, 2]));

    let (status, body) = send(&orch, "GET", "/api/features", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["name"], "login");
    assert_eq!(body[0]["steps"][1], "submit");

    let (status, body) = send(&orch, "GET", "/api/features/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], 1);

    let (status, body) = send(&orch, "GET", "/api/features/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dependencies"], serde_json::json!([1]));
    assert_eq!(body["passes"], false);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let orch = orchestrator().await;

    let (status, body) = send(&orch, "GET", "/api/features/42", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("42"));

    let (status, _) = send(&orch, "POST", "/api/features", Some(serde_json::json!([]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &orch,
        "POST",
        "/api/features",
        Some(serde_json::json!([{"name": "  "}])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&orch, "POST", "/api/control/reboot", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("reboot"));
}

#[tokio::test]
async fn control_endpoints_drive_run_status() {
    let orch = orchestrator().await;

    let (status, body) = send(&orch, "POST", "/api/control/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "start");
    assert_eq!(body["status"], "running");

    let (_, body) = send(&orch, "POST", "/api/control/pause", None).await;
    assert_eq!(body["status"], "paused");
    let (_, body) = send(&orch, "POST", "/api/control/resume", None).await;
    assert_eq!(body["status"], "running");
    let (_, body) = send(&orch, "POST", "/api/control/soft-stop", None).await;
    assert_eq!(body["status"], "stopped");
    let (_, body) = send(&orch, "POST", "/api/control/hard_stop", None).await;
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn snapshot_and_test_runs() {
    let orch = orchestrator().await;
    let store = orch.store();
    store
        .create_features(&[
            NewFeature::new("a"),
            NewFeature::new("b").with_dependencies(vec![1]),
        ])
        .await
        .unwrap();
    store.mark_passed(1).await.unwrap();
    store
        .record_test_runs(&[foreman_daemon::storage::NewTestRun {
            feature_id: 1,
            passes: true,
            worker_class: foreman_core::WorkerClass::Primary,
            agent_id: "agent-1".to_string(),
            note: None,
        }])
        .await
        .unwrap();

    let (status, body) = send(&orch, "GET", "/api/snapshot", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["progress"]["passing"], 1);
    assert_eq!(body["progress"]["total"], 2);
    assert_eq!(body["features"]["done"], serde_json::json!([1]));
    assert_eq!(body["features"]["ready"], serde_json::json!([2]));
    assert_eq!(body["status"], "stopped");

    let (status, body) = send(&orch, "GET", "/api/test-runs?feature_id=1&limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["agent_id"], "agent-1");
    assert_eq!(body[0]["worker_class"], "primary");

    let (_, body) = send(&orch, "GET", "/api/test-runs?feature_id=2", None).await;
    assert!(body.as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(orchestrator: &Orchestrator, observers: ObserverSettings) -> String {
    let app = router(AppState {
        orchestrator: orchestrator.clone(),
        observers,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://127.0.0.1:{}/ws", addr.port())
}

async fn next_frame(ws: &mut Ws) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no frame within 5s")
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

/// Read frames until one of type `kind` shows up.
async fn frame_of(ws: &mut Ws, kind: &str) -> serde_json::Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

#[tokio::test]
async fn observer_gets_connected_then_snapshot() {
    let orch = orchestrator().await;
    orch.store().create_feature(&NewFeature::new("a")).await.unwrap();
    let url = start_server(&orch, ObserverSettings::default()).await;

    let mut ws = connect(&url).await;
    let connected = next_frame(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["observer_id"].is_string());
    assert!(connected.get("seq").is_none());

    let snapshot = next_frame(&mut ws).await;
    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["progress"]["total"], 1);
    assert_eq!(snapshot["features"]["ready"], serde_json::json!([1]));
}

#[tokio::test]
async fn observer_receives_events_in_sequence() {
    let orch = orchestrator().await;
    let url = start_server(&orch, ObserverSettings::default()).await;
    let mut ws = connect(&url).await;
    frame_of(&mut ws, "snapshot").await;

    for id in 1..=3 {
        orch.hub().publish(ObserverEvent::FeatureUpdate {
            feature_id: id,
            passes: true,
            outcome: FeatureOutcome::Passed,
            agent_id: None,
        });
    }

    let mut seqs = Vec::new();
    for id in 1..=3 {
        let frame = frame_of(&mut ws, "feature_update").await;
        assert_eq!(frame["feature_id"], id);
        seqs.push(frame["seq"].as_u64().unwrap());
    }
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn observer_ping_snapshot_and_control() {
    let orch = orchestrator().await;
    let url = start_server(&orch, ObserverSettings::default()).await;
    let mut ws = connect(&url).await;
    frame_of(&mut ws, "snapshot").await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await["type"], "pong");

    ws.send(Message::Text(r#"{"type":"snapshot"}"#.into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await["type"], "snapshot");

    ws.send(Message::Text(r#"{"type":"bogus"}"#.into())).await.unwrap();
    assert_eq!(next_frame(&mut ws).await["type"], "error");

    ws.send(Message::Text(
        r#"{"type":"control","action":"start"}"#.into(),
    ))
    .await
    .unwrap();
    let status = frame_of(&mut ws, "agent_status").await;
    assert_eq!(status["status"], "running");
    assert_eq!(orch.status().await, foreman_daemon::orchestration::RunStatus::Running);
}

#[tokio::test]
async fn server_pings_and_drops_silent_observers() {
    let orch = orchestrator().await;
    let url = start_server(
        &orch,
        ObserverSettings {
            heartbeat_interval: Duration::from_millis(100),
            client_timeout: Duration::from_millis(250),
        },
    )
    .await;
    let mut ws = connect(&url).await;
    frame_of(&mut ws, "snapshot").await;
    assert_eq!(frame_of(&mut ws, "ping").await["type"], "ping");

    // Stay silent; the server closes the connection after the timeout.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "silent observer was not dropped");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orch.hub().stats().observers, 0);
}

#[tokio::test]
async fn lagging_observer_is_resynced() {
    let store = Database::open_in_memory().await.unwrap();
    let hub = EventHub::new(foreman_daemon::broadcast::HubConfig {
        capacity: 4,
        ..Default::default()
    });
    let orch = Orchestrator::new(store, hub, Arc::new(NoWorkers), &Config::default());
    let url = start_server(&orch, ObserverSettings::default()).await;
    let mut ws = connect(&url).await;
    frame_of(&mut ws, "snapshot").await;

    // Flood while the observer is not reading.
    for id in 1..=500 {
        orch.hub().publish(ObserverEvent::FeatureUpdate {
            feature_id: id,
            passes: false,
            outcome: FeatureOutcome::Released,
            agent_id: None,
        });
    }

    let resync = frame_of(&mut ws, "resync").await;
    assert!(resync["missed"].as_u64().unwrap() > 0);
    assert_eq!(next_frame(&mut ws).await["type"], "snapshot");
}
