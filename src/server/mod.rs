//! Local node API
//!
//! A small status surface served on the node's advertised port so that
//! operators and the coordinator can inspect the node directly.

pub mod handlers;
pub mod state;

pub use handlers::{create_router, NodeView};
pub use state::AppState;
