//! # Fleet membership for a worker node
//!
//! Everything a node needs to stay attached to a coordinator: registration,
//! heartbeats, and a command pipeline that executes coordinator-issued work
//! and reports results back.
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │       Coordinator        │
//!              │  /{prefix}/nodes/...     │
//!              └──────────────────────────┘
//!                 ▲        ▲          │
//!        register │  beat  │    poll  │ commands
//!                 │        │          ▼
//!   ┌─────────────────────────────────────────────┐
//!   │ NodeConnector                               │
//!   │  ┌───────────────────┐ ┌──────────────────┐ │
//!   │  │ HeartbeatReporter │ │ poll loop        │ │
//!   │  │ (ResourceSampler) │ │ → CommandHandler │ │
//!   │  └───────────────────┘ └──────────────────┘ │
//!   └─────────────────────────────────────────────┘
//!                                 │
//!                    ModelManager / ProcessSupervisor
//! ```

pub mod backoff;
pub mod client;
pub mod command;
pub mod connector;
pub mod dispatcher;
pub mod handlers;
pub mod heartbeat;
pub mod node;

pub use backoff::BackoffPolicy;
pub use client::{CoordinatorClient, CoordinatorError};
pub use command::{
    Command, CommandError, CommandRequest, CommandResult, CommandType, RunLlamacppPayload,
    ScanModelsPayload, StopProcessPayload, UnloadModelPayload,
};
pub use connector::{
    ConnectionState, ConnectorConfig, ConnectorError, NodeConnector, NodeConnectorBuilder,
};
pub use dispatcher::{CommandDispatcher, CommandHandler};
pub use heartbeat::{HeartbeatMessage, HeartbeatReporter};
pub use node::{Node, NodeCapabilities, NodeRole, NodeStatus, SharedNode};

/// Default port of the node's local status API
pub const NODE_API_PORT: u16 = 8080;

/// Default coordinator API path prefix
pub const DEFAULT_API_PREFIX: &str = "api/v1";

/// Default heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default command poll interval in seconds
pub const COMMAND_POLL_INTERVAL_SECS: u64 = 5;

/// Default registration attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
