//! Node resource - identity and observable state of one fleet member
//!
//! A Node:
//! - Registers with the coordinator
//! - Reports its capabilities (CPU, memory, GPUs, runtimes)
//! - Sends heartbeats carrying its latest resource snapshot

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::ResourceSnapshot;

/// Role a node plays in the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Not part of a fleet
    Standalone,
    /// Coordinator: accepts registrations and issues commands
    Master,
    /// Worker attached to a coordinator
    #[default]
    Client,
    /// Coordinator and worker at once
    Hybrid,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Standalone => "standalone",
            NodeRole::Master => "master",
            NodeRole::Client => "client",
            NodeRole::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Offline,
    Online,
    Busy,
    Error,
    Degraded,
    Disabled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Offline => "offline",
            NodeStatus::Online => "online",
            NodeStatus::Busy => "busy",
            NodeStatus::Error => "error",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a node can run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_names: Vec<String>,
    #[serde(default)]
    pub runtimes: Vec<String>,
}

impl NodeCapabilities {
    /// Derive capabilities from the host and a resource snapshot
    pub fn detect(snapshot: &ResourceSnapshot, runtimes: Vec<String>) -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            cpu_count,
            memory_bytes: snapshot.memory_total_bytes,
            gpu_count: snapshot.gpus.len() as u32,
            gpu_names: snapshot.gpus.iter().map(|g| g.name.clone()).collect(),
            runtimes,
        }
    }

    pub fn supports(&self, runtime: &str) -> bool {
        self.runtimes.iter().any(|r| r == runtime)
    }
}

/// Node descriptor shared between the connector and its loops
pub type SharedNode = Arc<RwLock<Node>>;

/// A member of the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable unique identifier
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub role: NodeRole,

    /// Address the coordinator can reach this node at
    pub address: String,

    pub port: u16,

    #[serde(default)]
    pub status: NodeStatus,

    #[serde(default)]
    pub capabilities: NodeCapabilities,

    /// Latest resource snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSnapshot>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    /// Create a new Node with minimal configuration
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            role: NodeRole::default(),
            address: address.into(),
            port: super::NODE_API_PORT,
            status: NodeStatus::Offline,
            capabilities: NodeCapabilities::default(),
            resources: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_seen: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get the full address (address:port)
    pub fn full_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Change status and bump `updated_at`
    pub fn set_status(&mut self, status: NodeStatus) {
        if self.status != status {
            self.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// Record contact with the coordinator
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    pub fn is_online(&self) -> bool {
        matches!(self.status, NodeStatus::Online | NodeStatus::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{GpuInfo, GpuVendor};

    #[test]
    fn test_create_node() {
        let node = Node::new("node-1", "worker-1", "192.168.1.100");

        assert_eq!(node.id, "node-1");
        assert_eq!(node.address, "192.168.1.100");
        assert_eq!(node.port, super::super::NODE_API_PORT);
        assert_eq!(node.role, NodeRole::Client);
        assert_eq!(node.status, NodeStatus::Offline);
        assert!(node.last_seen.is_none());
    }

    #[test]
    fn test_node_builder() {
        let node = Node::new("gpu-node", "gpu-node", "10.0.0.1")
            .with_port(9090)
            .with_role(NodeRole::Hybrid)
            .with_tag("a100")
            .with_metadata("rack", "r12");

        assert_eq!(node.full_address(), "10.0.0.1:9090");
        assert_eq!(node.tags, vec!["a100"]);
        assert_eq!(node.metadata.get("rack"), Some(&"r12".to_string()));
    }

    #[test]
    fn test_set_status_bumps_updated_at() {
        let mut node = Node::new("n", "n", "localhost");
        let before = node.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));

        node.set_status(NodeStatus::Online);
        assert!(node.is_online());
        assert!(node.updated_at > before);
    }

    #[test]
    fn test_enum_wire_format() {
        assert_eq!(serde_json::to_string(&NodeRole::Hybrid).unwrap(), "\"hybrid\"");
        assert_eq!(
            serde_json::to_string(&NodeStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        let status: NodeStatus = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(status, NodeStatus::Disabled);
    }

    #[test]
    fn test_capabilities_detect() {
        let snapshot = ResourceSnapshot {
            memory_total_bytes: 64,
            gpus: vec![GpuInfo {
                index: 0,
                name: "RTX 4090".to_string(),
                vendor: GpuVendor::Nvidia,
                utilization_percent: 0.0,
                memory_used_bytes: 0,
                memory_total_bytes: 24,
                temperature_celsius: 0.0,
                power_draw_watts: 0.0,
            }],
            ..Default::default()
        };

        let caps = NodeCapabilities::detect(&snapshot, vec!["llama.cpp".to_string()]);
        assert!(caps.cpu_count >= 1);
        assert_eq!(caps.memory_bytes, 64);
        assert_eq!(caps.gpu_count, 1);
        assert_eq!(caps.gpu_names, vec!["RTX 4090"]);
        assert!(caps.supports("llama.cpp"));
        assert!(!caps.supports("vllm"));
    }
}
