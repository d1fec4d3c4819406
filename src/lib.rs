//! # llmfleet
//!
//! Node agent for a fleet of llama.cpp inference workers. A node registers
//! with a coordinator, reports heartbeats carrying resource usage, and
//! executes the coordinator's commands (load/unload models, one-shot runs,
//! process control, model scans).

pub mod cli;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod runtime;
pub mod server;
