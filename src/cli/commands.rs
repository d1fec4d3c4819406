//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;

use crate::config::{load_config, ConfigError, NodeConfig};

use super::JoinArgs;

/// Result type for commands
pub type CommandResult<T> = Result<T, ConfigError>;

// ============================================================================
// Config overrides (Pure business logic)
// ============================================================================

/// Apply `join` flags on top of a loaded config
pub fn apply_join_overrides(config: &mut NodeConfig, args: &JoinArgs) {
    if let Some(url) = &args.coordinator_url {
        config.coordinator.url = url.clone();
    }
    if let Some(id) = &args.node_id {
        config.node.id = Some(id.clone());
    }
    if let Some(name) = &args.node_name {
        config.node.name = Some(name.clone());
    }
    if let Some(addr) = &args.advertise_addr {
        config.node.address = addr.clone();
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if !args.model_dirs.is_empty() {
        config.runtime.model_dirs = args.model_dirs.clone();
    }
    if let Some(binary) = &args.llama_server {
        config.runtime.llama_server_binary = binary.clone();
    }
    if let Some(secs) = args.heartbeat_interval {
        config.coordinator.heartbeat_interval_ms = secs.saturating_mul(1000);
    }
    if let Some(secs) = args.poll_interval {
        config.coordinator.command_poll_interval_ms = secs.saturating_mul(1000);
    }
    for tag in &args.tags {
        if !config.node.tags.contains(tag) {
            config.node.tags.push(tag.clone());
        }
    }
}

/// Load the config for `join`, apply flags and validate
pub fn prepare_join_config(path: Option<&Path>, args: &JoinArgs) -> CommandResult<NodeConfig> {
    let mut config = load_config(path)?;
    apply_join_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Validate Command
// ============================================================================

/// Result of validating a config file
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub node_id: Option<String>,
    pub coordinator_url: Option<String>,
    pub model_dirs: usize,
    pub error: Option<String>,
}

/// Validate the config at `path` (or the default location)
pub fn validate_config(path: Option<&Path>) -> ValidationResult {
    let checked = load_config(path).and_then(|config| config.validate().map(|_| config));

    match checked {
        Ok(config) => ValidationResult {
            valid: true,
            node_id: Some(config.resolved_node_id()),
            coordinator_url: Some(config.coordinator.url.clone()),
            model_dirs: config.runtime.model_dirs.len(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            node_id: None,
            coordinator_url: None,
            model_dirs: 0,
            error: Some(e.to_string()),
        },
    }
}
