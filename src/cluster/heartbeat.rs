//! Heartbeat reporter for worker nodes
//!
//! Runs as a background task that periodically reports liveness and the
//! latest resource snapshot to the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::CoordinatorClient;
use super::node::{NodeCapabilities, NodeRole, NodeStatus, SharedNode};
use crate::metrics::{ResourceSampler, ResourceSnapshot};

/// Consecutive failures after which delivery problems are logged as errors
pub const FAILURES_BEFORE_ERROR: u32 = 3;

/// One liveness and capacity report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: NodeStatus,
    pub role: NodeRole,
    pub resources: ResourceSnapshot,
    pub capabilities: NodeCapabilities,
    pub sequence: u64,
}

/// Periodic heartbeat sender
///
/// The sequence counter is shared with the owning connector so that numbers
/// keep increasing across reconnects.
pub struct HeartbeatReporter {
    client: Arc<CoordinatorClient>,
    node: SharedNode,
    sampler: Arc<ResourceSampler>,
    interval: Duration,
    sequence: Arc<AtomicU64>,
}

impl HeartbeatReporter {
    pub fn new(
        client: Arc<CoordinatorClient>,
        node: SharedNode,
        sampler: Arc<ResourceSampler>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            node,
            sampler,
            interval,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Share an existing sequence counter
    pub fn with_sequence(mut self, sequence: Arc<AtomicU64>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Last sequence number handed out
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Build the next message, consuming one sequence number
    ///
    /// Also stores the snapshot on the shared node descriptor.
    pub fn next_message(&self) -> HeartbeatMessage {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let resources = self.sampler.snapshot();

        let mut node = match self.node.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        node.resources = Some(resources.clone());

        HeartbeatMessage {
            node_id: node.id.clone(),
            timestamp: Utc::now(),
            status: node.status,
            role: node.role,
            resources,
            capabilities: node.capabilities.clone(),
            sequence,
        }
    }

    /// Run the heartbeat loop until `cancel` fires
    ///
    /// The first beat is sent immediately. Delivery failures are logged and
    /// swallowed.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        info!(
            "Starting heartbeat reporter: coordinator={}, interval={:?}",
            self.client.base_url(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let message = self.next_message();
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.client.send_heartbeat(&message) => sent,
            };

            match sent {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!("Heartbeat recovered after {} failures", consecutive_failures);
                    }
                    consecutive_failures = 0;
                    if let Ok(mut node) = self.node.write() {
                        node.touch();
                    }
                    debug!("Heartbeat {} sent", message.sequence);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= FAILURES_BEFORE_ERROR {
                        error!(
                            "Heartbeat failed {} consecutive times: {}",
                            consecutive_failures, e
                        );
                    } else {
                        warn!("Heartbeat failed (attempt {}): {}", consecutive_failures, e);
                    }
                }
            }
        }

        info!("Heartbeat reporter shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::Node;
    use std::sync::RwLock;

    fn reporter() -> HeartbeatReporter {
        let client = CoordinatorClient::new(
            "http://127.0.0.1:9",
            "api/v1",
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        let node = Node::new("worker-1", "worker-1", "127.0.0.1").with_role(NodeRole::Client);

        HeartbeatReporter::new(
            Arc::new(client),
            Arc::new(RwLock::new(node)),
            Arc::new(ResourceSampler::new(Duration::from_secs(60))),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let reporter = reporter();
        let first = reporter.next_message();
        let second = reporter.next_message();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.node_id, "worker-1");
        assert_eq!(first.role, NodeRole::Client);
    }

    #[test]
    fn test_shared_sequence_continues() {
        let shared = Arc::new(AtomicU64::new(41));
        let reporter = reporter().with_sequence(Arc::clone(&shared));

        assert_eq!(reporter.next_message().sequence, 42);
        assert_eq!(shared.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_message_wire_format() {
        let message = reporter().next_message();
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["node_id"], "worker-1");
        assert_eq!(value["status"], "offline");
        assert_eq!(value["role"], "client");
        assert!(value["resources"].is_object());
        assert!(value["capabilities"].is_object());
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let reporter = reporter();
        let sequence = Arc::clone(&reporter.sequence);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(reporter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Every tick consumed a number even though nothing was delivered
        assert!(sequence.load(Ordering::SeqCst) >= 2);
    }
}
