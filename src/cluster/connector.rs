//! Node connector - keeps a node attached to its coordinator
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──registered──▶ Registered
//!      ▲                          │                          │
//!      └──────── failed ──────────┘                    disconnect()
//!      │                                                     ▼
//!      └──────────────────────────────────────────── Disconnecting
//! ```
//!
//! Once registered, two loops run under one cancellation token: the
//! [`HeartbeatReporter`] and a command poll loop feeding the configured
//! [`CommandHandler`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backoff::BackoffPolicy;
use super::client::CoordinatorClient;
use super::command::{Command, CommandError, CommandResult};
use super::dispatcher::CommandHandler;
use super::heartbeat::HeartbeatReporter;
use super::node::{Node, NodeStatus, SharedNode};
use super::{
    COMMAND_POLL_INTERVAL_SECS, DEFAULT_API_PREFIX, HEARTBEAT_INTERVAL_SECS,
    MAX_RECONNECT_ATTEMPTS,
};
use crate::metrics::ResourceSampler;

/// Connection lifecycle of a [`NodeConnector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registered => "registered",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Errors returned by the connector
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node is already registered")]
    AlreadyRegistered,

    #[error("Cannot connect while {0}")]
    InvalidState(ConnectionState),

    #[error("Registration failed after {attempts} attempt(s): {reason}")]
    RegistrationFailed { attempts: u32, reason: String },

    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Coordinator connection settings
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Coordinator base URL (e.g., "http://master:8181")
    pub coordinator_url: String,

    /// Path prefix of the coordinator API (default: "api/v1")
    pub api_prefix: String,

    pub heartbeat_interval: Duration,

    pub command_poll_interval: Duration,

    /// Per-request timeout for coordinator calls
    pub request_timeout: Duration,

    /// Timeout for a single registration request
    pub register_timeout: Duration,

    /// Registration attempts before giving up
    pub max_reconnect_attempts: u32,

    pub backoff: BackoffPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            coordinator_url: String::new(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            command_poll_interval: Duration::from_secs(COMMAND_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(5),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ConnectorConfig {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.command_poll_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), ConnectorError> {
        if self.coordinator_url.trim().is_empty() {
            return Err(ConnectorError::Config("coordinator URL is required".into()));
        }
        reqwest::Url::parse(&self.coordinator_url).map_err(|e| {
            ConnectorError::Config(format!(
                "invalid coordinator URL '{}': {}",
                self.coordinator_url, e
            ))
        })?;
        if self.heartbeat_interval.is_zero() || self.command_poll_interval.is_zero() {
            return Err(ConnectorError::Config("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// Builder for [`NodeConnector`]
#[derive(Default)]
pub struct NodeConnectorBuilder {
    node: Option<Node>,
    config: ConnectorConfig,
    sampler: Option<Arc<ResourceSampler>>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl NodeConnectorBuilder {
    pub fn node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn coordinator_url(mut self, url: impl Into<String>) -> Self {
        self.config.coordinator_url = url.into();
        self
    }

    pub fn sampler(mut self, sampler: Arc<ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<NodeConnector, ConnectorError> {
        let node = self
            .node
            .filter(|n| !n.id.trim().is_empty())
            .ok_or_else(|| ConnectorError::Config("node id is required".into()))?;
        self.config.validate()?;
        let sampler = self
            .sampler
            .ok_or_else(|| ConnectorError::Config("resource sampler is required".into()))?;
        let handler = self
            .handler
            .ok_or_else(|| ConnectorError::Config("command handler is required".into()))?;

        let client = CoordinatorClient::new(
            self.config.coordinator_url.clone(),
            self.config.api_prefix.clone(),
            self.config.request_timeout,
            self.config.register_timeout,
        )
        .map_err(|e| ConnectorError::Config(format!("HTTP client: {}", e)))?;

        Ok(NodeConnector {
            inner: Arc::new(Inner {
                config: self.config,
                client: Arc::new(client),
                node: Arc::new(RwLock::new(node)),
                sampler,
                handler: RwLock::new(handler),
                connection: Mutex::new(Connection::default()),
                settled: Notify::new(),
                sequence: Arc::new(AtomicU64::new(0)),
                registration_attempts: AtomicU32::new(0),
            }),
        })
    }
}

struct Connection {
    state: ConnectionState,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            cancel: None,
            tasks: Vec::new(),
        }
    }
}

struct Inner {
    config: ConnectorConfig,
    client: Arc<CoordinatorClient>,
    node: SharedNode,
    sampler: Arc<ResourceSampler>,
    handler: RwLock<Arc<dyn CommandHandler>>,
    connection: Mutex<Connection>,
    /// Signalled when connect() finishes, whatever the outcome
    settled: Notify,
    sequence: Arc<AtomicU64>,
    registration_attempts: AtomicU32,
}

impl Inner {
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn node_info(&self) -> Node {
        match self.node.read() {
            Ok(node) => node.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn node_id(&self) -> String {
        match self.node.read() {
            Ok(node) => node.id.clone(),
            Err(poisoned) => poisoned.into_inner().id.clone(),
        }
    }

    fn set_status(&self, status: NodeStatus) {
        match self.node.write() {
            Ok(mut node) => node.set_status(status),
            Err(poisoned) => poisoned.into_inner().set_status(status),
        }
    }

    fn handler(&self) -> Arc<dyn CommandHandler> {
        match self.handler.read() {
            Ok(handler) => Arc::clone(&handler),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// Keeps one node registered with one coordinator
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct NodeConnector {
    inner: Arc<Inner>,
}

impl NodeConnector {
    pub fn builder() -> NodeConnectorBuilder {
        NodeConnectorBuilder::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ConnectionState::Registered
    }

    /// Copy of the cached node descriptor
    pub fn node_info(&self) -> Node {
        self.inner.node_info()
    }

    /// Registration attempts used by the last `connect()`
    pub fn registration_attempts(&self) -> u32 {
        self.inner.registration_attempts.load(Ordering::SeqCst)
    }

    /// Last heartbeat sequence number handed out
    pub fn heartbeat_sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Replace the node descriptor used by later heartbeats
    pub fn update_node_info(&self, node: Node) {
        match self.inner.node.write() {
            Ok(mut current) => *current = node,
            Err(poisoned) => *poisoned.into_inner() = node,
        }
    }

    /// Replace the handler used by subsequent polls
    pub fn set_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        match self.inner.handler.write() {
            Ok(mut current) => *current = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    /// Register with the coordinator and start the heartbeat and poll loops
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        let cancel = {
            let mut conn = self.inner.connection();
            match conn.state {
                ConnectionState::Disconnected => {}
                ConnectionState::Registered => return Err(ConnectorError::AlreadyRegistered),
                other => return Err(ConnectorError::InvalidState(other)),
            }
            let token = CancellationToken::new();
            conn.state = ConnectionState::Connecting;
            conn.cancel = Some(token.clone());
            token
        };

        let outcome = self.finish_connect(cancel).await;
        self.inner.settled.notify_waiters();
        outcome
    }

    async fn finish_connect(&self, cancel: CancellationToken) -> Result<(), ConnectorError> {
        let node_id = self.inner.node_id();
        let span = info_span!("connector", node_id = %node_id);
        let registered = self.register_with_retry(&cancel).instrument(span).await;

        if registered.is_ok() && !cancel.is_cancelled() {
            self.inner.set_status(NodeStatus::Online);
        }

        let spawned = {
            let mut conn = self.inner.connection();
            match registered {
                Ok(()) if !cancel.is_cancelled() => {
                    conn.tasks = self.spawn_loops(&node_id, &cancel);
                    conn.state = ConnectionState::Registered;
                    Ok(())
                }
                Ok(()) => {
                    conn.state = ConnectionState::Disconnected;
                    conn.cancel = None;
                    Err(ConnectorError::Cancelled)
                }
                Err(e) => {
                    conn.state = ConnectionState::Disconnected;
                    conn.cancel = None;
                    Err(e)
                }
            }
        };

        match spawned {
            Ok(()) => {
                info!(
                    "Node {} registered with {} ({} attempt(s))",
                    node_id,
                    self.inner.client.base_url(),
                    self.registration_attempts()
                );
                Ok(())
            }
            Err(ConnectorError::Cancelled) => {
                // Registered just as disconnect() arrived; undo it
                self.inner.set_status(NodeStatus::Offline);
                self.unregister_best_effort(&node_id).await;
                Err(ConnectorError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the loops and unregister. Safe to call in any state.
    ///
    /// While a `connect()` is registering, this cancels it and returns once
    /// that call has reset the state, so the pending `connect()` must still
    /// be polled for this to complete.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let pending = {
            let conn = self.inner.connection();
            if conn.state == ConnectionState::Connecting {
                // Created under the state lock, so the wakeup from connect()
                // cannot be missed
                let settled = self.inner.settled.notified();
                if let Some(cancel) = &conn.cancel {
                    cancel.cancel();
                }
                Some(settled)
            } else {
                None
            }
        };
        if let Some(settled) = pending {
            settled.await;
            return Ok(());
        }

        let (cancel, tasks) = {
            let mut conn = self.inner.connection();
            match conn.state {
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Registered => {
                    conn.state = ConnectionState::Disconnecting;
                    (conn.cancel.take(), std::mem::take(&mut conn.tasks))
                }
            }
        };

        let node_id = self.inner.node_id();
        info!("Disconnecting node {}", node_id);

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!("Connector task ended abnormally: {}", e);
            }
        }

        self.unregister_best_effort(&node_id).await;
        self.inner.set_status(NodeStatus::Offline);

        self.inner.connection().state = ConnectionState::Disconnected;
        info!("Node {} disconnected", node_id);
        Ok(())
    }

    async fn register_with_retry(&self, cancel: &CancellationToken) -> Result<(), ConnectorError> {
        let max_attempts = self.inner.config.max_reconnect_attempts.max(1);
        let backoff = self.inner.config.backoff;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.inner
                .registration_attempts
                .store(attempt, Ordering::SeqCst);
            let node = self.inner.node_info();

            let registered = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                registered = self.inner.client.register(&node) => registered,
            };

            let e = match registered {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    error!("Registration rejected: {}", e);
                    return Err(ConnectorError::RegistrationFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => e,
            };

            last_error = e.to_string();
            if attempt == max_attempts {
                break;
            }

            let delay = backoff.delay(attempt);
            warn!(
                "Registration attempt {}/{} failed: {}; retrying in {:?}",
                attempt, max_attempts, e, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        error!(
            "Registration failed after {} attempt(s): {}",
            max_attempts, last_error
        );
        Err(ConnectorError::RegistrationFailed {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    fn spawn_loops(&self, node_id: &str, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let reporter = HeartbeatReporter::new(
            Arc::clone(&self.inner.client),
            Arc::clone(&self.inner.node),
            Arc::clone(&self.inner.sampler),
            self.inner.config.heartbeat_interval,
        )
        .with_sequence(Arc::clone(&self.inner.sequence));

        let heartbeat = tokio::spawn(
            reporter
                .run(cancel.clone())
                .instrument(info_span!("heartbeat", node_id = %node_id)),
        );
        let poll = tokio::spawn(
            poll_loop(Arc::clone(&self.inner), cancel.clone())
                .instrument(info_span!("commands", node_id = %node_id)),
        );

        vec![heartbeat, poll]
    }

    async fn unregister_best_effort(&self, node_id: &str) {
        let limit = self.inner.config.request_timeout;
        match tokio::time::timeout(limit, self.inner.client.unregister(node_id)).await {
            Ok(Ok(())) => debug!("Unregistered node {}", node_id),
            Ok(Err(e)) => warn!("Failed to unregister node {}: {}", node_id, e),
            Err(_) => warn!("Unregister of node {} timed out after {:?}", node_id, limit),
        }
    }
}

/// Poll for commands until cancelled, running each in its own task
async fn poll_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.command_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut in_flight: JoinSet<()> = JoinSet::new();

    info!(
        "Starting command poll loop: interval={:?}",
        inner.config.command_poll_interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        while in_flight.try_join_next().is_some() {}

        let node_id = inner.node_id();
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = inner.client.poll_commands(&node_id) => polled,
        };

        let commands = match polled {
            Ok(commands) => commands,
            Err(e) => {
                warn!("Command poll failed: {}", e);
                continue;
            }
        };

        let handler = inner.handler();
        for command in commands {
            info!("Received command {} ({})", command.id, command.command_type);
            in_flight.spawn(
                execute_and_report(
                    Arc::clone(&inner),
                    Arc::clone(&handler),
                    command,
                    node_id.clone(),
                )
                .in_current_span(),
            );
        }
    }

    // Give running commands a chance to report before dropping them
    let grace = inner.config.request_timeout;
    let drained = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            "Abandoning {} in-flight command(s) after {:?}",
            in_flight.len(),
            grace
        );
        in_flight.shutdown().await;
    }

    info!("Command poll loop stopped");
}

async fn execute_and_report(
    inner: Arc<Inner>,
    handler: Arc<dyn CommandHandler>,
    command: Command,
    node_id: String,
) {
    let result = run_isolated(handler, &command).await;
    let result = normalize_result(result, &command, &node_id);

    if result.success {
        info!("Command {} succeeded in {}ms", command.id, result.duration_ms);
    } else {
        warn!(
            "Command {} failed: {}",
            command.id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if let Err(e) = inner.client.post_result(&result).await {
        error!("Failed to post result for command {}: {}", command.id, e);
    }
}

/// Run the handler, turning a panic into a failed result. The handler is
/// polled by the calling task, so aborting that task cancels it too.
async fn run_isolated(handler: Arc<dyn CommandHandler>, command: &Command) -> CommandResult {
    let started = std::time::Instant::now();

    match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            CommandResult::failure(command, &CommandError::Panicked(reason))
                .with_duration(started.elapsed())
        }
    }
}

/// Tie a handler's result to the command it answers
pub(crate) fn normalize_result(
    mut result: CommandResult,
    command: &Command,
    node_id: &str,
) -> CommandResult {
    if result.command_id != command.id {
        warn!(
            "Handler returned result for '{}' while executing '{}'; correcting",
            result.command_id, command.id
        );
        result.command_id = command.id.clone();
    }
    result.from_node_id = node_id.to_string();
    if result.to_node_id.is_empty() {
        result.to_node_id = command.from_node_id.clone();
    }
    result
}
