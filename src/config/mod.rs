//! Node agent configuration
//!
//! Loaded from YAML (or JSON, which `serde_yaml` also accepts). Every field
//! has a default, so an empty file is a valid config; CLI flags are applied
//! on top before validation.
//!
//! ```yaml
//! node:
//!   id: gpu-worker-1
//!   address: 10.0.0.12
//!   tags: [a100]
//! coordinator:
//!   url: http://10.0.0.1:8181
//!   heartbeat_interval_ms: 15000
//! runtime:
//!   model_dirs: [~/models]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{
    BackoffPolicy, ConnectorConfig, Node, NodeCapabilities, NodeRole, COMMAND_POLL_INTERVAL_SECS,
    DEFAULT_API_PREFIX, HEARTBEAT_INTERVAL_SECS, MAX_RECONNECT_ATTEMPTS, NODE_API_PORT,
};
use crate::runtime::ModelManagerConfig;

/// Default config file location: ~/.llmfleet/node.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llmfleet")
        .join("node.yaml")
}

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub coordinator: CoordinatorSection,

    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub sampler: SamplerSection,
}

/// Identity of this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Stable node id; derived from the hostname when absent
    pub id: Option<String>,
    pub name: Option<String>,
    pub role: NodeRole,
    /// Address the coordinator reaches this node at
    pub address: String,
    /// Port of the local node API
    pub port: u16,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            role: NodeRole::Client,
            address: "127.0.0.1".to_string(),
            port: NODE_API_PORT,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Where and how to reach the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub url: String,
    pub api_prefix: String,
    pub request_timeout_ms: u64,
    pub register_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub command_poll_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            request_timeout_ms: 10_000,
            register_timeout_ms: 5_000,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_SECS * 1000,
            command_poll_interval_ms: COMMAND_POLL_INTERVAL_SECS * 1000,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
        }
    }
}

/// Inference server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub llama_server_binary: PathBuf,
    pub model_dirs: Vec<PathBuf>,
    /// Address spawned servers bind to
    pub host: String,
    pub base_port: u16,
    pub ready_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let manager = ModelManagerConfig::default();
        Self {
            llama_server_binary: manager.server_binary,
            model_dirs: Vec::new(),
            host: manager.host,
            base_port: manager.base_port,
            ready_timeout_ms: manager.ready_timeout.as_millis() as u64,
            stop_grace_ms: crate::runtime::supervisor::DEFAULT_STOP_GRACE.as_millis() as u64,
        }
    }
}

/// Resource sampler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub interval_ms: u64,
    /// Path whose filesystem is reported as disk usage
    pub disk_path: PathBuf,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            interval_ms: crate::metrics::DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
            disk_path: PathBuf::from("/"),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from a YAML or JSON string
pub fn parse_config(content: &str) -> Result<NodeConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(NodeConfig::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Turn a hostname into a node id: lowercase, `[a-z0-9-]` only
pub fn sanitize_node_id(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    mapped.trim_matches('-').to_string()
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return invalid("node.id must not be empty");
            }
        }
        if self.node.address.trim().is_empty() {
            return invalid("node.address must not be empty");
        }

        let c = &self.coordinator;
        if c.url.trim().is_empty() {
            return invalid("coordinator.url is required");
        }
        reqwest::Url::parse(&c.url).map_err(|e| {
            ConfigError::Invalid(format!("coordinator.url '{}' is not a URL: {}", c.url, e))
        })?;
        if c.heartbeat_interval_ms == 0 || c.command_poll_interval_ms == 0 {
            return invalid("coordinator intervals must be greater than zero");
        }
        if c.request_timeout_ms == 0 || c.register_timeout_ms == 0 {
            return invalid("coordinator timeouts must be greater than zero");
        }
        if c.max_reconnect_attempts == 0 {
            return invalid("coordinator.max_reconnect_attempts must be at least 1");
        }
        if c.backoff_base_ms > c.backoff_cap_ms {
            return invalid("coordinator.backoff_base_ms must not exceed backoff_cap_ms");
        }

        if self.sampler.interval_ms == 0 {
            return invalid("sampler.interval_ms must be greater than zero");
        }
        if self.runtime.base_port == 0 {
            return invalid("runtime.base_port must be non-zero");
        }
        Ok(())
    }

    /// Node id from config, else from the hostname, else a random UUID
    pub fn resolved_node_id(&self) -> String {
        if let Some(id) = self.node.id.as_ref().filter(|id| !id.trim().is_empty()) {
            return id.trim().to_string();
        }
        hostname::get()
            .ok()
            .map(|h| sanitize_node_id(&h.to_string_lossy()))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Node descriptor advertised to the coordinator
    pub fn build_node(&self, capabilities: NodeCapabilities) -> Node {
        let id = self.resolved_node_id();
        let name = self.node.name.clone().unwrap_or_else(|| id.clone());
        let mut node = Node::new(id, name, self.node.address.clone())
            .with_port(self.node.port)
            .with_role(self.node.role)
            .with_capabilities(capabilities);
        node.tags = self.node.tags.clone();
        node.metadata = self.node.metadata.clone();
        node
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        let c = &self.coordinator;
        ConnectorConfig {
            coordinator_url: c.url.clone(),
            api_prefix: c.api_prefix.clone(),
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            command_poll_interval: Duration::from_millis(c.command_poll_interval_ms),
            request_timeout: Duration::from_millis(c.request_timeout_ms),
            register_timeout: Duration::from_millis(c.register_timeout_ms),
            max_reconnect_attempts: c.max_reconnect_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(c.backoff_base_ms),
                Duration::from_millis(c.backoff_cap_ms),
            ),
        }
    }

    pub fn model_manager_config(&self) -> ModelManagerConfig {
        let r = &self.runtime;
        ModelManagerConfig {
            server_binary: expand(&r.llama_server_binary),
            model_dirs: r.model_dirs.iter().map(|d| expand(d)).collect(),
            host: r.host.clone(),
            base_port: r.base_port,
            ready_timeout: Duration::from_millis(r.ready_timeout_ms),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.runtime.stop_grace_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sampler.interval_ms)
    }

    pub fn disk_path(&self) -> PathBuf {
        expand(&self.sampler.disk_path)
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a config file from disk
pub fn load_config_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let content = std::fs::read_to_string(expand(path))?;
    parse_config(&content)
}

/// Load `path` if given, else the default location if it exists, else defaults
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    match path {
        Some(path) => load_config_file(path),
        None => {
            let default_path = default_config_path();
            if default_path.exists() {
                load_config_file(&default_path)
            } else {
                Ok(NodeConfig::default())
            }
        }
    }
}
