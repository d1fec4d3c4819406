//! llama.cpp server configuration and CLI argument generation
//!
//! This module turns load parameters into CLI arguments for llama.cpp's
//! `llama-server` (OpenAI-compatible API server).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default context size when a load request does not specify one
pub const DEFAULT_CTX_SIZE: u32 = 4096;

/// Tuning parameters for a `llama-server` instance
///
/// Field names accept the llama.cpp aliases (`n_ctx`, `ngl`, `n_threads`,
/// `n_batch`) as well as the long forms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    #[serde(default, alias = "n_ctx", skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,

    #[serde(
        default,
        alias = "n_gpu_layers",
        alias = "ngl",
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu_layers: Option<i32>,

    #[serde(default, alias = "n_threads", skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,

    #[serde(default, alias = "n_batch", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,

    /// Raw `--flag value` pairs passed through as-is
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, Value>,
}

impl LoadParams {
    /// Context size to launch with
    pub fn effective_ctx_size(&self) -> u32 {
        self.ctx_size.unwrap_or(DEFAULT_CTX_SIZE)
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Generate CLI arguments for llama-server
///
/// The context size is always passed; other parameters only when set.
/// `extra_args` keys are normalized to `--kebab-case`; booleans become bare
/// flags when true and are dropped when false.
pub fn generate_args(model: &str, host: &str, port: u16, params: &LoadParams) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        model.to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--ctx-size".to_string(),
        params.effective_ctx_size().to_string(),
    ];

    let mut push = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value);
        }
    };

    push("--n-gpu-layers", params.gpu_layers.map(|v| v.to_string()));
    push("--threads", params.threads.map(|v| v.to_string()));
    push("--batch-size", params.batch_size.map(|v| v.to_string()));
    push("--temp", params.temperature.map(|v| v.to_string()));
    push("--top-p", params.top_p.map(|v| v.to_string()));
    push("--top-k", params.top_k.map(|v| v.to_string()));
    push("--repeat-penalty", params.repeat_penalty.map(|v| v.to_string()));

    for (key, value) in &params.extra_args {
        let arg_name = format!("--{}", key.trim_start_matches('-').replace('_', "-"));
        match value {
            Value::Bool(true) => args.push(arg_name),
            Value::Number(n) => {
                args.push(arg_name);
                args.push(n.to_string());
            }
            Value::String(s) => {
                args.push(arg_name);
                args.push(s.clone());
            }
            _ => {}
        }
    }

    args
}

/// Generate the OpenAI-compatible endpoint URL for a llama-server instance
pub fn endpoint_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/v1", host, port)
}

/// Generate the health URL polled while a llama-server instance loads
pub fn health_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/health", host, port)
}
