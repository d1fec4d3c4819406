use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{ConnectionState, Node};
use crate::metrics::ResourceSnapshot;
use crate::runtime::ProcessListing;
use crate::server::state::AppState;

/// Concurrent requests served by the node API
pub const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Response of `GET /v1/node`
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeView {
    pub node: Node,
    pub state: ConnectionState,
    pub heartbeat_sequence: u64,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn node(State(state): State<AppState>) -> Json<NodeView> {
    Json(NodeView {
        node: state.connector.node_info(),
        state: state.connector.state(),
        heartbeat_sequence: state.connector.heartbeat_sequence(),
    })
}

async fn resources(State(state): State<AppState>) -> Json<ResourceSnapshot> {
    Json(state.sampler.snapshot())
}

async fn processes(State(state): State<AppState>) -> Json<ProcessListing> {
    Json(state.processes.list_all())
}

/// Create the Axum router for the node API
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/node", get(node))
        .route("/v1/resources", get(resources))
        .route("/v1/processes", get(processes))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
