//! Command dispatch
//!
//! [`CommandHandler`] is the seam the connector's poll loop hands commands
//! to. [`CommandDispatcher`] is the built-in handler: it validates the
//! envelope into a [`CommandRequest`], runs the matching handler, and records
//! duration and completion time on the result.
//!
//! Delivery from the coordinator is at-least-once. The dispatcher remembers
//! results by command id for a bounded time; a redelivered command gets the
//! remembered result instead of running again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::command::{Command, CommandRequest, CommandResult};
use super::handlers::{self, Failure, HandlerResult, SCAN_TIMEOUT};
use crate::runtime::{ModelManager, ProcessSupervisor};

/// How long completed results are remembered for redelivery
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Executes one command and produces its result
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> CommandResult;
}

struct CachedResult {
    inserted: Instant,
    cell: Arc<OnceCell<CommandResult>>,
}

/// Built-in handler for the coordinator's command set
pub struct CommandDispatcher {
    models: Arc<dyn ModelManager>,
    processes: Arc<dyn ProcessSupervisor>,
    completed: DashMap<String, CachedResult>,
    cache_ttl: Duration,
    scan_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(models: Arc<dyn ModelManager>, processes: Arc<dyn ProcessSupervisor>) -> Self {
        Self {
            models,
            processes,
            completed: DashMap::new(),
            cache_ttl: RESULT_CACHE_TTL,
            scan_timeout: SCAN_TIMEOUT,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Number of remembered command ids
    pub fn cached_results(&self) -> usize {
        self.completed.len()
    }

    /// Execute `command`, or return the remembered result for its id
    pub async fn dispatch(&self, command: &Command) -> CommandResult {
        self.evict_expired();

        let cell = self
            .completed
            .entry(command.id.clone())
            .or_insert_with(|| CachedResult {
                inserted: Instant::now(),
                cell: Arc::new(OnceCell::new()),
            })
            .cell
            .clone();

        if let Some(result) = cell.get() {
            info!("Command {} already executed, returning cached result", command.id);
            return result.clone();
        }

        cell.get_or_init(|| self.execute(command)).await.clone()
    }

    async fn execute(&self, command: &Command) -> CommandResult {
        let started = Instant::now();
        debug!("Executing command {} ({})", command.id, command.command_type);

        let outcome = match CommandRequest::parse(command) {
            Ok(request) => self.run(request, command).await,
            Err(e) => Err(Failure::from(e)),
        };

        let result = match outcome {
            Ok(value) => CommandResult::success(command, value),
            Err(Failure { error, result }) => {
                warn!("Command {} failed: {}", command.id, error);
                let failed = CommandResult::failure(command, &error);
                match result {
                    Some(partial) => failed.with_result(partial),
                    None => failed,
                }
            }
        };

        result.with_duration(started.elapsed())
    }

    async fn run(&self, request: CommandRequest, command: &Command) -> HandlerResult {
        match request {
            CommandRequest::LoadModel(req) => handlers::load_model(self.models.as_ref(), req).await,
            CommandRequest::UnloadModel(req) => {
                handlers::unload_model(self.models.as_ref(), req).await
            }
            CommandRequest::RunLlamacpp(req) => {
                handlers::run_llamacpp(req, command.timeout_duration()).await
            }
            CommandRequest::StopProcess(req) => {
                handlers::stop_process(self.processes.as_ref(), req).await
            }
            CommandRequest::ScanModels(req) => {
                handlers::scan_models(self.models.as_ref(), req, self.scan_timeout).await
            }
        }
    }

    /// Drop entries older than the TTL, including ones whose execution was
    /// cancelled before it produced a result
    fn evict_expired(&self) {
        let ttl = self.cache_ttl;
        self.completed.retain(|_, cached| cached.inserted.elapsed() < ttl);
    }
}

#[async_trait]
impl CommandHandler for CommandDispatcher {
    async fn handle(&self, command: &Command) -> CommandResult {
        self.dispatch(command).await
    }
}
