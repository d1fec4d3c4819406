//! Model management for llama.cpp workers
//!
//! [`ModelManager`] is the seam command handlers load, unload and scan models
//! through. [`LocalModelManager`] implements it on top of a
//! [`ProcessSupervisor`]: models are `.gguf` files found under configured
//! directories, each served by its own `llama-server` process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::llamacpp::{self, LoadParams};
use super::supervisor::{next_free_port, ProcessSpec, ProcessSupervisor, SupervisorError};

/// Extension of model files picked up by scans
pub const MODEL_EXTENSION: &str = "gguf";

/// Errors reported by a model manager
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Model '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Process error: {0}")]
    Process(#[from] SupervisorError),

    #[error("Scan failed: {0}")]
    Scan(String),
}

/// Request to bring a model online
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_id: String,
    #[serde(flatten)]
    pub params: LoadParams,
}

/// Outcome of a successful load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub model_id: String,
    pub port: u16,
    pub ctx_size: u32,
    pub duration_ms: u64,
}

/// A model file found by a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// A path a scan could not read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub path: PathBuf,
    pub error: String,
}

/// Result of scanning model directories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub models: Vec<ModelSummary>,
    pub errors: Vec<ScanIssue>,
    pub duration_ms: u64,
    pub total_files: usize,
    pub matched_files: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<DateTime<Utc>>,
}

/// Loads, unloads and discovers models
#[async_trait]
pub trait ModelManager: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<LoadResponse, ModelError>;

    async fn unload(&self, model_id: &str) -> Result<(), ModelError>;

    /// Scan `paths`, or the manager's configured directories when empty
    async fn scan(&self, paths: &[PathBuf]) -> Result<ScanReport, ModelError>;
}

/// Settings for [`LocalModelManager`]
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Path to the `llama-server` binary
    pub server_binary: PathBuf,
    /// Directories searched for model files
    pub model_dirs: Vec<PathBuf>,
    /// Address spawned servers bind to
    pub host: String,
    /// First port handed to spawned servers
    pub base_port: u16,
    pub ready_timeout: Duration,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            server_binary: PathBuf::from("llama-server"),
            model_dirs: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 8100,
            ready_timeout: super::supervisor::DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Model manager that serves `.gguf` files with `llama-server`
pub struct LocalModelManager {
    config: ModelManagerConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    catalog: RwLock<HashMap<String, ModelSummary>>,
}

impl LocalModelManager {
    pub fn new(config: ModelManagerConfig, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self {
            config,
            supervisor,
            catalog: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.config
    }

    /// Models found by the most recent scan
    pub fn catalog(&self) -> Vec<ModelSummary> {
        let mut models: Vec<ModelSummary> = self
            .catalog
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Resolve a model id to a file: an existing path is used as-is, otherwise
    /// the catalog is consulted, rescanning once on a miss.
    async fn resolve(&self, model_id: &str) -> Result<PathBuf, ModelError> {
        let as_path = PathBuf::from(shellexpand::tilde(model_id).as_ref());
        if as_path.is_file() {
            return Ok(as_path);
        }

        if let Some(path) = self.lookup(model_id) {
            return Ok(path);
        }

        debug!("Model '{}' not in catalog, rescanning", model_id);
        self.scan(&[]).await?;
        self.lookup(model_id)
            .ok_or_else(|| ModelError::NotFound(model_id.to_string()))
    }

    fn lookup(&self, model_id: &str) -> Option<PathBuf> {
        self.catalog
            .read()
            .ok()
            .and_then(|c| c.get(model_id).map(|m| m.path.clone()))
    }
}

#[async_trait]
impl ModelManager for LocalModelManager {
    async fn load(&self, request: LoadRequest) -> Result<LoadResponse, ModelError> {
        let started = Instant::now();
        let model_path = self.resolve(&request.model_id).await?;

        let port = next_free_port(&self.supervisor.list_all(), self.config.base_port);
        let ctx_size = request.params.effective_ctx_size();
        let args = llamacpp::generate_args(
            model_path.to_string_lossy().as_ref(),
            &self.config.host,
            port,
            &request.params,
        );

        let spec = ProcessSpec::new(&request.model_id, &self.config.server_binary)
            .with_args(args)
            .with_port(port)
            .with_ctx_size(ctx_size)
            .with_health_check(
                llamacpp::health_url(&self.config.host, port),
                self.config.ready_timeout,
            );

        self.supervisor.start(spec).await?;

        info!(
            "Loaded model '{}' at {}",
            request.model_id,
            llamacpp::endpoint_url(&self.config.host, port)
        );

        Ok(LoadResponse {
            model_id: request.model_id,
            port,
            ctx_size,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn unload(&self, model_id: &str) -> Result<(), ModelError> {
        match self.supervisor.stop(model_id, false).await {
            Ok(()) => {
                info!("Unloaded model '{}'", model_id);
                Ok(())
            }
            Err(SupervisorError::NotFound(_)) => Err(ModelError::NotLoaded(model_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self, paths: &[PathBuf]) -> Result<ScanReport, ModelError> {
        let roots: Vec<PathBuf> = if paths.is_empty() {
            self.config.model_dirs.clone()
        } else {
            paths.to_vec()
        };
        if roots.is_empty() {
            return Err(ModelError::Scan("no model directories configured".to_string()));
        }

        let report = tokio::task::spawn_blocking(move || scan_dirs(&roots))
            .await
            .map_err(|e| ModelError::Scan(e.to_string()))?;

        if let Ok(mut catalog) = self.catalog.write() {
            for model in &report.models {
                catalog.insert(model.id.clone(), model.clone());
            }
        }

        info!(
            "Scanned {} files, {} models, {} errors in {}ms",
            report.total_files,
            report.matched_files,
            report.errors.len(),
            report.duration_ms
        );
        Ok(report)
    }
}

/// Walk `roots` recursively collecting model files. Unreadable paths are
/// reported as issues, never as a failure of the whole scan.
pub fn scan_dirs(roots: &[PathBuf]) -> ScanReport {
    let started = Instant::now();
    let mut report = ScanReport::default();

    let mut pending: Vec<PathBuf> = roots
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()))
        .collect();

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read {}: {}", dir.display(), e);
                report.errors.push(ScanIssue {
                    path: dir,
                    error: e.to_string(),
                });
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    report.errors.push(ScanIssue {
                        path: dir.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let path = entry.path();
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    report.errors.push(ScanIssue {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(path);
                continue;
            }

            report.total_files += 1;
            if !is_model_file(&path) {
                continue;
            }
            report.matched_files += 1;
            report.models.push(ModelSummary {
                id: model_id_for(&path),
                size_bytes: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }
    }

    report.models.sort_by(|a, b| a.id.cmp(&b.id));
    report.duration_ms = started.elapsed().as_millis() as u64;
    report.scanned_at = Some(Utc::now());
    report
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION))
        .unwrap_or(false)
}

/// Model id for a file: its name without the extension
pub fn model_id_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::supervisor::LocalProcessSupervisor;

    fn touch(path: &Path, bytes: usize) {
        std::fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_model_id_for() {
        assert_eq!(model_id_for(Path::new("/m/qwen2-7b.Q4_K_M.gguf")), "qwen2-7b.Q4_K_M");
        assert!(is_model_file(Path::new("a.GGUF")));
        assert!(!is_model_file(Path::new("a.bin")));
    }

    #[test]
    fn test_scan_dirs_recurses_and_collects_errors() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        touch(&dir.path().join("llama.gguf"), 16);
        touch(&nested.join("mistral.gguf"), 32);
        touch(&nested.join("README.md"), 4);

        let missing = dir.path().join("missing");
        let report = scan_dirs(&[dir.path().to_path_buf(), missing.clone()]);

        assert_eq!(report.total_files, 3);
        assert_eq!(report.matched_files, 2);
        assert_eq!(report.models[0].id, "llama");
        assert_eq!(report.models[1].id, "mistral");
        assert_eq!(report.models[1].size_bytes, 32);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].path, missing);
        assert!(report.scanned_at.is_some());
    }

    #[tokio::test]
    async fn test_scan_populates_catalog() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("phi3.gguf"), 8);

        let manager = LocalModelManager::new(
            ModelManagerConfig {
                model_dirs: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            Arc::new(LocalProcessSupervisor::new()),
        );

        let report = manager.scan(&[]).await.unwrap();
        assert_eq!(report.matched_files, 1);
        assert_eq!(manager.catalog()[0].id, "phi3");
        assert_eq!(
            manager.resolve("phi3").await.unwrap(),
            dir.path().join("phi3.gguf")
        );
    }

    #[tokio::test]
    async fn test_scan_without_dirs_fails() {
        let manager = LocalModelManager::new(
            ModelManagerConfig::default(),
            Arc::new(LocalProcessSupervisor::new()),
        );
        assert!(matches!(manager.scan(&[]).await, Err(ModelError::Scan(_))));
    }

    #[tokio::test]
    async fn test_load_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalModelManager::new(
            ModelManagerConfig {
                model_dirs: vec![dir.path().to_path_buf()],
                ..Default::default()
            },
            Arc::new(LocalProcessSupervisor::new()),
        );

        let result = manager
            .load(LoadRequest {
                model_id: "absent".into(),
                params: LoadParams::default(),
            })
            .await;
        assert!(matches!(result, Err(ModelError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unload_not_loaded() {
        let manager = LocalModelManager::new(
            ModelManagerConfig::default(),
            Arc::new(LocalProcessSupervisor::new()),
        );
        assert!(matches!(
            manager.unload("absent").await,
            Err(ModelError::NotLoaded(_))
        ));
    }

    #[test]
    fn test_load_request_flattens_params() {
        let request: LoadRequest = serde_json::from_value(serde_json::json!({
            "model_id": "qwen",
            "ctx_size": 8192,
            "ngl": 99
        }))
        .unwrap();
        assert_eq!(request.model_id, "qwen");
        assert_eq!(request.params.ctx_size, Some(8192));
        assert_eq!(request.params.gpu_layers, Some(99));
    }
}
