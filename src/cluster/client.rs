//! HTTP client for the coordinator API
//!
//! The only place that knows coordinator paths and what their status codes
//! mean. All endpoints live under `{base_url}/{prefix}`.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::command::{Command, CommandResult};
use super::heartbeat::HeartbeatMessage;
use super::node::Node;

/// Errors talking to the coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Coordinator returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid coordinator response: {0}")]
    Decode(String),
}

impl CoordinatorError {
    /// Transport failures and 5xx are worth retrying; other statuses are not
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::Request(_) => true,
            CoordinatorError::Status { status, .. } => *status >= 500,
            CoordinatorError::Decode(_) => false,
        }
    }
}

/// Typed client for the coordinator's node endpoints
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
    prefix: String,
    register_timeout: Duration,
}

impl CoordinatorClient {
    pub fn new(
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        request_timeout: Duration,
        register_timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        let http = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            prefix: prefix.into().trim_matches('/').to_string(),
            register_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for an endpoint path
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if self.prefix.is_empty() {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}/{}", self.base_url, self.prefix, path)
        }
    }

    /// Register `node`; bounded by the registration timeout
    pub async fn register(&self, node: &Node) -> Result<(), CoordinatorError> {
        let response = self
            .http
            .post(self.url("nodes/register"))
            .timeout(self.register_timeout)
            .json(node)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn unregister(&self, node_id: &str) -> Result<(), CoordinatorError> {
        let response = self
            .http
            .post(self.url(&format!("nodes/{}/unregister", node_id)))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    pub async fn send_heartbeat(&self, message: &HeartbeatMessage) -> Result<(), CoordinatorError> {
        self.post_json("heartbeat", message).await
    }

    /// Fetch pending commands; 204, an empty body and `null` all mean none
    pub async fn poll_commands(&self, node_id: &str) -> Result<Vec<Command>, CoordinatorError> {
        let response = self
            .http
            .get(self.url(&format!("nodes/{}/commands", node_id)))
            .send()
            .await?;

        let response = check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let commands: Option<Vec<Command>> =
            serde_json::from_slice(&body).map_err(|e| CoordinatorError::Decode(e.to_string()))?;
        let commands = commands.unwrap_or_default();
        debug!("Polled {} command(s)", commands.len());
        Ok(commands)
    }

    pub async fn post_result(&self, result: &CommandResult) -> Result<(), CoordinatorError> {
        self.post_json("command/result", result).await
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), CoordinatorError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        check(response).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response, CoordinatorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(CoordinatorError::Status {
        status: status.as_u16(),
        message,
    })
}
