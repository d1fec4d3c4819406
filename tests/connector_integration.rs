//! Integration tests for the node connector
//!
//! A small axum app stands in for the coordinator. It records every
//! registration, heartbeat and posted result so the tests can assert on
//! what the node actually sent over the wire.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

use llmfleet::cluster::{
    BackoffPolicy, Command, CommandDispatcher, CommandHandler, CommandResult, ConnectionState,
    ConnectorConfig, ConnectorError, Node, NodeConnector, NodeStatus,
};
use llmfleet::metrics::ResourceSampler;
use llmfleet::runtime::{
    LoadRequest, LoadResponse, LocalProcessSupervisor, ModelError, ModelManager, ScanReport,
};
use llmfleet::server::{create_router, AppState};

/// Find an available port for testing
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Recorded traffic of the mock coordinator
#[derive(Clone, Default)]
struct Coordinator {
    /// Registrations answered with `fail_status` before the first success
    fail_first: usize,
    fail_status: u16,
    register_calls: Arc<AtomicUsize>,
    unregister_calls: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
    heartbeats: Arc<Mutex<Vec<Value>>>,
    batches: Arc<Mutex<VecDeque<Vec<Value>>>>,
    results: Arc<Mutex<Vec<Value>>>,
}

impl Coordinator {
    fn failing(fail_first: usize, fail_status: u16) -> Self {
        Self {
            fail_first,
            fail_status,
            ..Default::default()
        }
    }

    fn queue(&self, batch: Vec<Value>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    fn results(&self) -> Vec<Value> {
        self.results.lock().unwrap().clone()
    }

    fn heartbeats(&self) -> Vec<Value> {
        self.heartbeats.lock().unwrap().clone()
    }
}

async fn register(State(c): State<Coordinator>, Json(_node): Json<Value>) -> Response {
    let call = c.register_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if call <= c.fail_first {
        let status = StatusCode::from_u16(c.fail_status).unwrap();
        return (status, "coordinator busy").into_response();
    }
    Json(json!({ "registered": true })).into_response()
}

async fn unregister(State(c): State<Coordinator>, Path(_id): Path<String>) -> StatusCode {
    c.unregister_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn heartbeat(State(c): State<Coordinator>, Json(message): Json<Value>) -> StatusCode {
    c.heartbeats.lock().unwrap().push(message);
    StatusCode::OK
}

async fn commands(State(c): State<Coordinator>, Path(_id): Path<String>) -> Response {
    c.polls.fetch_add(1, Ordering::SeqCst);
    match c.batches.lock().unwrap().pop_front() {
        Some(batch) => Json(batch).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn result(State(c): State<Coordinator>, Json(result): Json<Value>) -> StatusCode {
    c.results.lock().unwrap().push(result);
    StatusCode::OK
}

/// Start the mock coordinator and return its base URL
async fn start_coordinator(coordinator: Coordinator) -> String {
    let app = Router::new()
        .route("/api/v1/nodes/register", post(register))
        .route("/api/v1/nodes/{id}/unregister", post(unregister))
        .route("/api/v1/heartbeat", post(heartbeat))
        .route("/api/v1/nodes/{id}/commands", get(commands))
        .route("/api/v1/command/result", post(result))
        .with_state(coordinator);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind coordinator");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

fn fast_config(url: &str, max_attempts: u32) -> ConnectorConfig {
    ConnectorConfig::new(url)
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(50))
        .with_max_reconnect_attempts(max_attempts)
        .with_request_timeout(Duration::from_secs(2))
        .with_backoff(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
        ))
}

fn connector(id: &str, config: ConnectorConfig, handler: Arc<dyn CommandHandler>) -> NodeConnector {
    NodeConnector::builder()
        .node(Node::new(id, id, "127.0.0.1"))
        .config(config)
        .sampler(Arc::new(ResourceSampler::new(Duration::from_secs(60))))
        .handler(handler)
        .build()
        .expect("Failed to build connector")
}

async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Succeeds every command and counts invocations
#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    async fn handle(&self, command: &Command) -> CommandResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CommandResult::success(command, json!({ "handled": command.command_type }))
    }
}

struct PanickingHandler;

#[async_trait]
impl CommandHandler for PanickingHandler {
    async fn handle(&self, _command: &Command) -> CommandResult {
        panic!("handler blew up");
    }
}

/// Sleeps before succeeding; records whether it ever got to finish
#[derive(Default)]
struct SlowHandler {
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl CommandHandler for SlowHandler {
    async fn handle(&self, command: &Command) -> CommandResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(1500)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        CommandResult::success(command, json!({}))
    }
}

/// Model manager that only counts loads
#[derive(Default)]
struct CountingModels {
    loads: AtomicUsize,
}

#[async_trait]
impl ModelManager for CountingModels {
    async fn load(&self, request: LoadRequest) -> Result<LoadResponse, ModelError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        Ok(LoadResponse {
            model_id: request.model_id,
            port: 8090,
            ctx_size: 4096,
            duration_ms: 100,
        })
    }

    async fn unload(&self, _model_id: &str) -> Result<(), ModelError> {
        Ok(())
    }

    async fn scan(&self, _paths: &[PathBuf]) -> Result<ScanReport, ModelError> {
        Ok(ScanReport::default())
    }
}

fn load_command(id: &str, model: &str) -> Value {
    json!({
        "id": id,
        "type": "load_model",
        "from_node_id": "master",
        "to_node_id": "worker",
        "payload": { "model_id": model }
    })
}

#[tokio::test]
async fn test_connect_and_reject_second_connect() {
    let coordinator = Coordinator::default();
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-a", fast_config(&url, 3), Arc::new(CountingHandler::default()));

    assert_ok!(node.connect().await);
    assert_eq!(node.state(), ConnectionState::Registered);
    assert!(node.is_registered());
    assert_eq!(node.registration_attempts(), 1);
    assert_eq!(node.node_info().status, NodeStatus::Online);

    let second = node.connect().await;
    assert!(matches!(second, Err(ConnectorError::AlreadyRegistered)));
    assert_eq!(coordinator.register_calls.load(Ordering::SeqCst), 1);

    assert_ok!(node.disconnect().await);
}

#[tokio::test]
async fn test_disconnect_unregisters_once_and_stops_loops() {
    let coordinator = Coordinator::default();
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-b", fast_config(&url, 3), Arc::new(CountingHandler::default()));

    assert_ok!(node.connect().await);
    assert!(wait_for(Duration::from_secs(2), || coordinator.polls.load(Ordering::SeqCst) > 0).await);

    assert_ok!(node.disconnect().await);
    assert_eq!(node.state(), ConnectionState::Disconnected);
    assert_eq!(node.node_info().status, NodeStatus::Offline);
    assert_eq!(coordinator.unregister_calls.load(Ordering::SeqCst), 1);

    // Idempotent
    assert_ok!(node.disconnect().await);
    assert_eq!(coordinator.unregister_calls.load(Ordering::SeqCst), 1);

    let polls = coordinator.polls.load(Ordering::SeqCst);
    let heartbeats = coordinator.heartbeats().len();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.polls.load(Ordering::SeqCst), polls);
    assert_eq!(coordinator.heartbeats().len(), heartbeats);
}

#[tokio::test]
async fn test_registration_retries_until_success() {
    let coordinator = Coordinator::failing(2, 503);
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-c", fast_config(&url, 5), Arc::new(CountingHandler::default()));

    assert_ok!(node.connect().await);
    assert!(node.is_registered());
    assert_eq!(node.registration_attempts(), 3);
    assert_eq!(coordinator.register_calls.load(Ordering::SeqCst), 3);

    assert_ok!(node.disconnect().await);
}

#[tokio::test]
async fn test_registration_gives_up_after_max_attempts() {
    let coordinator = Coordinator::failing(usize::MAX, 503);
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-d", fast_config(&url, 2), Arc::new(CountingHandler::default()));

    let err = assert_err!(node.connect().await);
    match err {
        ConnectorError::RegistrationFailed { attempts, reason } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("503"), "unexpected reason: {}", reason);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(node.state(), ConnectionState::Disconnected);
    assert_eq!(coordinator.register_calls.load(Ordering::SeqCst), 2);

    // A failed connect leaves the connector reusable
    assert_ok!(node.disconnect().await);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let coordinator = Coordinator::failing(usize::MAX, 400);
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-e", fast_config(&url, 5), Arc::new(CountingHandler::default()));

    let err = assert_err!(node.connect().await);
    assert!(matches!(
        err,
        ConnectorError::RegistrationFailed { attempts: 1, .. }
    ));
    assert_eq!(coordinator.register_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_registration() {
    let coordinator = Coordinator::failing(usize::MAX, 503);
    let url = start_coordinator(coordinator.clone()).await;
    let config = fast_config(&url, 10).with_backoff(BackoffPolicy::new(
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let node = connector("node-f", config, Arc::new(CountingHandler::default()));

    let connecting = {
        let node = node.clone();
        tokio::spawn(async move { node.connect().await })
    };
    assert!(
        wait_for(Duration::from_secs(2), || {
            coordinator.register_calls.load(Ordering::SeqCst) > 0
        })
        .await
    );

    let started = Instant::now();
    assert_ok!(node.disconnect().await);
    let outcome = tokio::time::timeout(Duration::from_secs(2), connecting)
        .await
        .expect("connect did not observe cancellation")
        .unwrap();

    assert!(matches!(outcome, Err(ConnectorError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(node.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_heartbeats_start_promptly_and_count_up() {
    let coordinator = Coordinator::default();
    let url = start_coordinator(coordinator.clone()).await;
    let node = connector("node-g", fast_config(&url, 3), Arc::new(CountingHandler::default()));

    assert_ok!(node.connect().await);

    // First beat is sent immediately, well within 1.5 intervals
    assert!(wait_for(Duration::from_millis(300), || !coordinator.heartbeats().is_empty()).await);
    assert!(wait_for(Duration::from_secs(2), || coordinator.heartbeats().len() >= 3).await);
    assert_ok!(node.disconnect().await);

    let beats = coordinator.heartbeats();
    assert!(beats.iter().all(|b| b["node_id"] == "node-g"));
    let sequences: Vec<u64> = beats.iter().map(|b| b["sequence"].as_u64().unwrap()).collect();
    assert_eq!(sequences[0], 1);
    assert!(sequences.windows(2).all(|w| w[1] > w[0]));
    assert!(node.heartbeat_sequence() >= 3);
}

#[tokio::test]
async fn test_command_round_trip() {
    let coordinator = Coordinator::default();
    coordinator.queue(vec![load_command("cmd-1", "tinyllama")]);
    let url = start_coordinator(coordinator.clone()).await;

    let handler = Arc::new(CountingHandler::default());
    let node = connector("worker", fast_config(&url, 3), handler.clone());
    assert_ok!(node.connect().await);

    assert!(wait_for(Duration::from_secs(3), || coordinator.results().len() == 1).await);
    // Nothing further once the queue is drained
    sleep(Duration::from_millis(200)).await;
    assert_ok!(node.disconnect().await);

    let results = coordinator.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["command_id"], "cmd-1");
    assert_eq!(results[0]["success"], true);
    assert_eq!(results[0]["from_node_id"], "worker");
    assert_eq!(results[0]["to_node_id"], "master");
    assert_eq!(results[0]["result"]["handled"], "load_model");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_handler_reports_failure() {
    let coordinator = Coordinator::default();
    coordinator.queue(vec![load_command("cmd-panic", "tinyllama")]);
    let url = start_coordinator(coordinator.clone()).await;

    let node = connector("worker", fast_config(&url, 3), Arc::new(PanickingHandler));
    assert_ok!(node.connect().await);

    assert!(wait_for(Duration::from_secs(3), || coordinator.results().len() == 1).await);
    // The loops survive the panic
    assert!(node.is_registered());
    assert_ok!(node.disconnect().await);

    let results = coordinator.results();
    assert_eq!(results[0]["command_id"], "cmd-panic");
    assert_eq!(results[0]["success"], false);
    assert!(results[0]["error"].as_str().unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_disconnect_cancels_running_commands() {
    let coordinator = Coordinator::default();
    coordinator.queue(vec![load_command("cmd-slow", "llama-70b")]);
    let url = start_coordinator(coordinator.clone()).await;

    let handler = Arc::new(SlowHandler::default());
    let config = fast_config(&url, 3).with_request_timeout(Duration::from_millis(200));
    let node = connector("worker", config, handler.clone());
    assert_ok!(node.connect().await);

    assert!(wait_for(Duration::from_secs(2), || handler.started.load(Ordering::SeqCst) == 1).await);
    assert_ok!(node.disconnect().await);

    // The abandoned command must not keep running in the background
    sleep(Duration::from_millis(2000)).await;
    assert_eq!(handler.finished.load(Ordering::SeqCst), 0);
    assert!(coordinator.results().is_empty());
}

#[tokio::test]
async fn test_connect_right_after_cancelled_registration() {
    let coordinator = Coordinator::failing(usize::MAX, 503);
    let url = start_coordinator(coordinator.clone()).await;
    let config = fast_config(&url, 10).with_backoff(BackoffPolicy::new(
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let node = connector("node-h", config, Arc::new(CountingHandler::default()));

    let connecting = {
        let node = node.clone();
        tokio::spawn(async move { node.connect().await })
    };
    assert!(
        wait_for(Duration::from_secs(2), || {
            coordinator.register_calls.load(Ordering::SeqCst) > 0
        })
        .await
    );

    assert_ok!(node.disconnect().await);
    // disconnect() only returns once the pending connect() has settled
    assert_eq!(node.state(), ConnectionState::Disconnected);
    assert!(matches!(
        connecting.await.unwrap(),
        Err(ConnectorError::Cancelled)
    ));

    // A new registration can start straight away
    let before = coordinator.register_calls.load(Ordering::SeqCst);
    let reconnecting = {
        let node = node.clone();
        tokio::spawn(async move { node.connect().await })
    };
    assert!(
        wait_for(Duration::from_secs(2), || {
            coordinator.register_calls.load(Ordering::SeqCst) > before
        })
        .await
    );
    assert_eq!(node.state(), ConnectionState::Connecting);

    assert_ok!(node.disconnect().await);
    assert!(matches!(
        reconnecting.await.unwrap(),
        Err(ConnectorError::Cancelled)
    ));
    assert_eq!(node.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_redelivered_command_executes_once() {
    let coordinator = Coordinator::default();
    // Delivered on two consecutive polls while the first copy is still loading
    coordinator.queue(vec![load_command("cmd-dup", "mistral")]);
    coordinator.queue(vec![load_command("cmd-dup", "mistral")]);
    let url = start_coordinator(coordinator.clone()).await;

    let models = Arc::new(CountingModels::default());
    let dispatcher = Arc::new(CommandDispatcher::new(
        models.clone(),
        Arc::new(LocalProcessSupervisor::new()),
    ));
    let node = connector("worker", fast_config(&url, 3), dispatcher.clone());
    assert_ok!(node.connect().await);

    assert!(wait_for(Duration::from_secs(3), || coordinator.results().len() == 2).await);
    assert_ok!(node.disconnect().await);

    assert_eq!(models.loads.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.cached_results(), 1);
    let results = coordinator.results();
    assert!(results.iter().all(|r| r["command_id"] == "cmd-dup"));
    assert!(results.iter().all(|r| r["success"] == true));
    assert_eq!(results[0]["result"], results[1]["result"]);
}

#[tokio::test]
async fn test_node_api_reports_connector_state() {
    let coordinator = Coordinator::default();
    let url = start_coordinator(coordinator.clone()).await;

    let sampler = Arc::new(ResourceSampler::new(Duration::from_secs(60)));
    let node = NodeConnector::builder()
        .node(Node::new("node-api", "node-api", "127.0.0.1"))
        .config(fast_config(&url, 3))
        .sampler(Arc::clone(&sampler))
        .handler(Arc::new(CountingHandler::default()))
        .build()
        .unwrap();

    let port = find_available_port();
    let app = create_router(AppState::new(
        node.clone(),
        sampler,
        Arc::new(LocalProcessSupervisor::new()),
    ));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind node API");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let base_url = format!("http://127.0.0.1:{}", port);

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Failed to query health");
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = client
        .get(format!("{}/v1/node", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"], "disconnected");

    assert_ok!(node.connect().await);
    let body: Value = client
        .get(format!("{}/v1/node", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"], "registered");
    assert_eq!(body["node"]["status"], "online");

    assert_ok!(node.disconnect().await);
}
