//! Execution of each built-in command type
//!
//! Each handler takes a validated payload and returns the JSON result posted
//! back to the coordinator, or a [`Failure`] carrying the error and any
//! partial result.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::command::{
    CommandError, RunLlamacppPayload, ScanModelsPayload, StopProcessPayload, UnloadModelPayload,
};
use crate::runtime::{
    run_with_timeout, LoadRequest, ModelError, ModelManager, ProcessSupervisor, SupervisorError,
    DEFAULT_EXEC_TIMEOUT,
};

/// Upper bound for a model directory scan
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// A failed execution, optionally with partial output
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error: CommandError,
    pub result: Option<Value>,
}

impl From<CommandError> for Failure {
    fn from(error: CommandError) -> Self {
        Self {
            error,
            result: None,
        }
    }
}

pub type HandlerResult = Result<Value, Failure>;

pub async fn load_model(models: &dyn ModelManager, request: LoadRequest) -> HandlerResult {
    let model_id = request.model_id.clone();
    let response = models
        .load(request)
        .await
        .map_err(|e| CommandError::LoadFailed(format!("{}: {}", model_id, e)))?;

    info!(
        "Loaded model {} on port {} (ctx={}, {}ms)",
        response.model_id, response.port, response.ctx_size, response.duration_ms
    );
    Ok(json!(response))
}

pub async fn unload_model(models: &dyn ModelManager, payload: UnloadModelPayload) -> HandlerResult {
    models
        .unload(&payload.model_id)
        .await
        .map_err(|e| CommandError::UnloadFailed(format!("{}: {}", payload.model_id, e)))?;

    info!("Unloaded model {}", payload.model_id);
    Ok(json!({
        "model_id": payload.model_id,
        "unloaded": true,
    }))
}

/// Run llama.cpp to completion
///
/// The timeout comes from the payload, else `fallback` (the command's own
/// timeout), else [`DEFAULT_EXEC_TIMEOUT`].
pub async fn run_llamacpp(payload: RunLlamacppPayload, fallback: Option<Duration>) -> HandlerResult {
    let limit = payload
        .timeout
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .or(fallback)
        .unwrap_or(DEFAULT_EXEC_TIMEOUT);

    let mut args = vec![
        "--model".to_string(),
        payload.model_path.display().to_string(),
    ];
    args.extend(payload.args.iter().cloned());

    info!(
        "Running {} with {} (timeout {:?})",
        payload.binary_path.display(),
        payload.model_path.display(),
        limit
    );

    let run = run_with_timeout(&payload.binary_path, &args, limit)
        .await
        .map_err(|e| CommandError::ExecutionFailed {
            exit_code: None,
            message: e.to_string(),
        })?;

    let result = json!({
        "output": run.output,
        "exit_code": run.exit_code,
        "timed_out": run.timed_out,
        "duration_ms": run.elapsed.as_millis() as u64,
    });

    if run.timed_out {
        return Err(Failure {
            error: CommandError::Timeout(limit),
            result: Some(result),
        });
    }
    if run.exit_code != Some(0) {
        return Err(Failure {
            error: CommandError::ExecutionFailed {
                exit_code: run.exit_code,
                message: "llama.cpp exited unsuccessfully".to_string(),
            },
            result: Some(result),
        });
    }
    Ok(result)
}

pub async fn stop_process(
    processes: &dyn ProcessSupervisor,
    payload: StopProcessPayload,
) -> HandlerResult {
    if processes.get(&payload.process_id).is_none() {
        return Err(CommandError::NotFound(payload.process_id).into());
    }

    processes
        .stop(&payload.process_id, payload.force)
        .await
        .map_err(|e| match e {
            SupervisorError::NotFound(key) => CommandError::NotFound(key),
            other => CommandError::StopFailed(other.to_string()),
        })?;

    info!("Stopped process {} (force={})", payload.process_id, payload.force);
    Ok(json!({
        "process_id": payload.process_id,
        "stopped": true,
        "force": payload.force,
    }))
}

pub async fn scan_models(
    models: &dyn ModelManager,
    payload: ScanModelsPayload,
    limit: Duration,
) -> HandlerResult {
    let report = match tokio::time::timeout(limit, models.scan(&payload.paths)).await {
        Ok(Ok(report)) => report,
        Ok(Err(ModelError::Scan(reason))) => return Err(CommandError::ScanFailed(reason).into()),
        Ok(Err(e)) => return Err(CommandError::ScanFailed(e.to_string()).into()),
        Err(_) => {
            return Err(CommandError::ScanFailed(format!("timed out after {:?}", limit)).into())
        }
    };

    if !report.errors.is_empty() {
        warn!("Model scan skipped {} unreadable path(s)", report.errors.len());
    }
    info!(
        "Scanned {} file(s), found {} model(s) in {}ms",
        report.total_files,
        report.models.len(),
        report.duration_ms
    );

    Ok(json!({
        "count": report.models.len(),
        "models": report.models,
        "errors": report.errors,
        "duration_ms": report.duration_ms,
        "total_files": report.total_files,
        "matched_files": report.matched_files,
        "scanned_at": report.scanned_at,
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("llama-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn payload(binary: PathBuf, timeout: Option<u64>) -> RunLlamacppPayload {
        RunLlamacppPayload {
            binary_path: binary,
            model_path: PathBuf::from("/models/tiny.gguf"),
            args: vec!["-n".to_string(), "8".to_string()],
            timeout,
        }
    }

    #[tokio::test]
    async fn test_run_llamacpp_success() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo \"args: $*\"");

        let result = run_llamacpp(payload(bin, Some(5)), None).await.unwrap();
        assert_eq!(result["exit_code"], 0);
        let output = result["output"].as_str().unwrap();
        assert!(output.contains("--model /models/tiny.gguf -n 8"));
    }

    #[tokio::test]
    async fn test_run_llamacpp_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo oops 1>&2; exit 3");

        let failure = run_llamacpp(payload(bin, Some(5)), None).await.unwrap_err();
        assert!(matches!(
            failure.error,
            CommandError::ExecutionFailed {
                exit_code: Some(3),
                ..
            }
        ));
        let result = failure.result.unwrap();
        assert!(result["output"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn test_run_llamacpp_timeout_falls_back_to_command() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo warming up; exec sleep 10");

        let failure = run_llamacpp(payload(bin, None), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(failure.error, CommandError::Timeout(Duration::from_secs(1)));
        let result = failure.result.unwrap();
        assert_eq!(result["timed_out"], true);
        assert!(result["output"].as_str().unwrap().contains("warming up"));
    }

    #[tokio::test]
    async fn test_run_llamacpp_missing_binary() {
        let failure = run_llamacpp(payload(PathBuf::from("/nonexistent/llama-cli"), Some(1)), None)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            CommandError::ExecutionFailed {
                exit_code: None,
                ..
            }
        ));
    }
}
