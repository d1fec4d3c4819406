//! Coordinator commands and their results
//!
//! Commands arrive as a loosely-typed envelope (`type` string plus JSON
//! payload). They are validated once, at the dispatch boundary, into a
//! [`CommandRequest`]; everything past that point works with typed payloads.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::LoadRequest;

/// A unit of work issued by the coordinator to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique, caller-assigned id
    pub id: String,

    #[serde(rename = "type")]
    pub command_type: String,

    /// Issuer of the command
    #[serde(default)]
    pub from_node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_node_id: Option<String>,

    #[serde(default)]
    pub payload: Value,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Execution timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub max_retries: u32,
}

impl Command {
    pub fn new(id: impl Into<String>, command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            command_type: command_type.into(),
            from_node_id: String::new(),
            to_node_id: None,
            payload,
            created_at: Utc::now(),
            timeout: None,
            priority: 0,
            retry_count: 0,
            max_retries: 0,
        }
    }

    pub fn from_node(mut self, node_id: impl Into<String>) -> Self {
        self.from_node_id = node_id.into();
        self
    }

    pub fn to_node(mut self, node_id: impl Into<String>) -> Self {
        self.to_node_id = Some(node_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

/// Known command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    LoadModel,
    UnloadModel,
    RunLlamacpp,
    StopProcess,
    ScanModels,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::LoadModel => "load_model",
            CommandType::UnloadModel => "unload_model",
            CommandType::RunLlamacpp => "run_llamacpp",
            CommandType::StopProcess => "stop_process",
            CommandType::ScanModels => "scan_models",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load_model" => Ok(CommandType::LoadModel),
            "unload_model" => Ok(CommandType::UnloadModel),
            "run_llamacpp" => Ok(CommandType::RunLlamacpp),
            "stop_process" => Ok(CommandType::StopProcess),
            "scan_models" => Ok(CommandType::ScanModels),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnloadModelPayload {
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLlamacppPayload {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopProcessPayload {
    pub process_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanModelsPayload {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandRequest {
    LoadModel(LoadRequest),
    UnloadModel(UnloadModelPayload),
    RunLlamacpp(RunLlamacppPayload),
    StopProcess(StopProcessPayload),
    ScanModels(ScanModelsPayload),
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn decode<T: DeserializeOwned>(kind: CommandType, payload: &Value) -> Result<T, CommandError> {
    // A missing payload decodes like an empty object so that errors name the
    // missing field
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(payload)
        .map_err(|e| CommandError::InvalidPayload(format!("{}: {}", kind, e)))
}

fn require(kind: CommandType, field: &str, value: &str) -> Result<(), CommandError> {
    if value.trim().is_empty() {
        return Err(CommandError::InvalidPayload(format!(
            "{}: `{}` must not be empty",
            kind, field
        )));
    }
    Ok(())
}

impl CommandRequest {
    /// Validate a command envelope into a typed request
    pub fn parse(command: &Command) -> Result<Self, CommandError> {
        let kind: CommandType = command.command_type.parse()?;
        let request = match kind {
            CommandType::LoadModel => {
                let req: LoadRequest = decode(kind, &command.payload)?;
                require(kind, "model_id", &req.model_id)?;
                CommandRequest::LoadModel(req)
            }
            CommandType::UnloadModel => {
                let req: UnloadModelPayload = decode(kind, &command.payload)?;
                require(kind, "model_id", &req.model_id)?;
                CommandRequest::UnloadModel(req)
            }
            CommandType::RunLlamacpp => {
                let req: RunLlamacppPayload = decode(kind, &command.payload)?;
                require(kind, "binary_path", &req.binary_path.to_string_lossy())?;
                require(kind, "model_path", &req.model_path.to_string_lossy())?;
                CommandRequest::RunLlamacpp(req)
            }
            CommandType::StopProcess => {
                let req: StopProcessPayload = decode(kind, &command.payload)?;
                require(kind, "process_id", &req.process_id)?;
                CommandRequest::StopProcess(req)
            }
            CommandType::ScanModels => CommandRequest::ScanModels(decode(kind, &command.payload)?),
        };
        Ok(request)
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            CommandRequest::LoadModel(_) => CommandType::LoadModel,
            CommandRequest::UnloadModel(_) => CommandType::UnloadModel,
            CommandRequest::RunLlamacpp(_) => CommandType::RunLlamacpp,
            CommandRequest::StopProcess(_) => CommandType::StopProcess,
            CommandRequest::ScanModels(_) => CommandType::ScanModels,
        }
    }
}

/// Errors captured into a failed [`CommandResult`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Failed to unload model: {0}")]
    UnloadFailed(String),

    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Execution failed with exit code {}: {message}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    ExecutionFailed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Failed to stop process: {0}")]
    StopFailed(String),

    #[error("Model scan failed: {0}")]
    ScanFailed(String),

    #[error("Command handler panicked: {0}")]
    Panicked(String),
}

/// Outcome of one command, posted back to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,

    /// Node that executed the command
    pub from_node_id: String,

    /// Original issuer
    pub to_node_id: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub completed_at: DateTime<Utc>,

    pub duration_ms: u64,
}

impl CommandResult {
    fn for_command(command: &Command, success: bool) -> Self {
        Self {
            command_id: command.id.clone(),
            from_node_id: command.to_node_id.clone().unwrap_or_default(),
            to_node_id: command.from_node_id.clone(),
            success,
            result: None,
            error: None,
            completed_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Successful result carrying `result`
    pub fn success(command: &Command, result: Value) -> Self {
        let mut out = Self::for_command(command, true);
        out.result = Some(result);
        out
    }

    /// Failed result carrying the error message
    pub fn failure(command: &Command, error: &CommandError) -> Self {
        let mut out = Self::for_command(command, false);
        out.error = Some(error.to_string());
        out
    }

    /// Attach a result payload (partial output on failure)
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}
