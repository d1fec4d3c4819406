//! CLI module for the llmfleet node agent
//!
//! Subcommands:
//! - `llmfleet join` - Register with a coordinator and serve commands until stopped
//! - `llmfleet resources` - Print one resource snapshot
//! - `llmfleet scan` - Scan directories for model files
//! - `llmfleet validate` - Validate a node config file

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "llmfleet")]
#[command(about = "Node agent for a fleet of llama.cpp inference workers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.llmfleet/node.yaml)
    #[arg(long, global = true, env = "LLMFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a coordinator and execute its commands until interrupted
    Join(JoinArgs),

    /// Print the current resource usage of this machine
    Resources(ResourcesArgs),

    /// Scan directories for .gguf model files
    Scan(ScanArgs),

    /// Validate the node config file
    Validate,
}

/// Arguments for the join command
#[derive(Parser, Debug, Default)]
pub struct JoinArgs {
    /// Coordinator base URL (e.g., http://10.0.0.1:8181)
    #[arg(long, env = "LLMFLEET_COORDINATOR_URL")]
    pub coordinator_url: Option<String>,

    /// Node id (default: derived from the hostname)
    #[arg(long, env = "LLMFLEET_NODE_ID")]
    pub node_id: Option<String>,

    /// Human-readable node name (default: the node id)
    #[arg(long)]
    pub node_name: Option<String>,

    /// Address the coordinator can reach this node at
    #[arg(long, env = "LLMFLEET_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Bind address for the local node API
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port of the local node API
    #[arg(short, long, env = "LLMFLEET_PORT")]
    pub port: Option<u16>,

    /// Directory to search for models (repeatable)
    #[arg(long = "model-dir", value_name = "DIR")]
    pub model_dirs: Vec<PathBuf>,

    /// Path to the llama-server binary
    #[arg(long, env = "LLMFLEET_LLAMA_SERVER")]
    pub llama_server: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Command poll interval in seconds
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Tag advertised with the node (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

/// Arguments for the resources command
#[derive(Parser, Debug, Default)]
pub struct ResourcesArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Report disk usage for the filesystem holding this path
    #[arg(long)]
    pub disk_path: Option<PathBuf>,
}

/// Arguments for the scan command
#[derive(Parser, Debug, Default)]
pub struct ScanArgs {
    /// Directories to scan (default: runtime.model_dirs from the config)
    pub paths: Vec<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
