use std::sync::Arc;

use crate::cluster::NodeConnector;
use crate::metrics::ResourceSampler;
use crate::runtime::ProcessSupervisor;

/// Shared state of the node API
#[derive(Clone)]
pub struct AppState {
    pub connector: NodeConnector,
    pub sampler: Arc<ResourceSampler>,
    pub processes: Arc<dyn ProcessSupervisor>,
}

impl AppState {
    pub fn new(
        connector: NodeConnector,
        sampler: Arc<ResourceSampler>,
        processes: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            connector,
            sampler,
            processes,
        }
    }
}
