//! Resource sampling for worker nodes
//!
//! The sampler measures CPU, memory, disk and GPU utilization on a fixed
//! interval and keeps the latest [`ResourceSnapshot`] for heartbeats and the
//! node API. Readers always get a copy.

pub mod gpu;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use gpu::{GpuInfo, GpuVendor};

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound for a single GPU probe
pub const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable point-in-time resource measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    pub uptime_secs: u64,
    pub sampled_at: DateTime<Utc>,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_used_bytes: 0,
            memory_total_bytes: 0,
            disk_used_bytes: 0,
            disk_total_bytes: 0,
            gpus: Vec::new(),
            uptime_secs: 0,
            sampled_at: Utc::now(),
        }
    }
}

impl ResourceSnapshot {
    /// Memory utilization percentage (0.0 - 100.0)
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_used_bytes, self.memory_total_bytes)
    }

    /// Disk utilization percentage (0.0 - 100.0)
    pub fn disk_percent(&self) -> f64 {
        percent(self.disk_used_bytes, self.disk_total_bytes)
    }

    /// Mean utilization across all GPUs, zero without GPUs
    pub fn gpu_percent(&self) -> f64 {
        if self.gpus.is_empty() {
            return 0.0;
        }
        self.gpus.iter().map(|g| g.utilization_percent).sum::<f64>() / self.gpus.len() as f64
    }

    /// Total GPU memory across all GPUs
    pub fn gpu_memory_total_bytes(&self) -> u64 {
        self.gpus.iter().map(|g| g.memory_total_bytes).sum()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

/// Host counters read through `sysinfo`
struct HostProbe {
    system: System,
    disks: Disks,
    disk_path: PathBuf,
}

impl HostProbe {
    fn new(disk_path: PathBuf) -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
            disk_path,
        }
    }

    fn measure(&mut self, gpus: Vec<GpuInfo>) -> ResourceSnapshot {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let (disk_used, disk_total) = disk_usage(&self.disks, &self.disk_path);

        ResourceSnapshot {
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_used_bytes: self.system.used_memory(),
            memory_total_bytes: self.system.total_memory(),
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
            gpus,
            uptime_secs: System::uptime(),
            sampled_at: Utc::now(),
        }
    }
}

/// Usage of the disk mounted closest to `path`, `(0, 0)` if none matches.
fn disk_usage(disks: &Disks, path: &Path) -> (u64, u64) {
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| {
            let total = d.total_space();
            (total.saturating_sub(d.available_space()), total)
        })
        .unwrap_or((0, 0))
}

struct SamplerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic resource sampler
pub struct ResourceSampler {
    interval: Duration,
    gpu_timeout: Duration,
    probe: Arc<Mutex<HostProbe>>,
    latest: Arc<Mutex<ResourceSnapshot>>,
    task: Mutex<Option<SamplerTask>>,
}

impl ResourceSampler {
    /// Create a sampler measuring the root filesystem
    pub fn new(interval: Duration) -> Self {
        Self::with_disk_path(interval, "/")
    }

    /// Create a sampler measuring the filesystem that holds `disk_path`
    pub fn with_disk_path(interval: Duration, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            interval,
            gpu_timeout: GPU_PROBE_TIMEOUT,
            probe: Arc::new(Mutex::new(HostProbe::new(disk_path.into()))),
            latest: Arc::new(Mutex::new(ResourceSnapshot::default())),
            task: Mutex::new(None),
        }
    }

    /// Override the GPU probe timeout
    pub fn with_gpu_timeout(mut self, timeout: Duration) -> Self {
        self.gpu_timeout = timeout;
        self
    }

    /// Sampling interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Latest snapshot (a copy)
    pub fn snapshot(&self) -> ResourceSnapshot {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Take one sample now and store it as the latest snapshot
    pub async fn sample_once(&self) -> ResourceSnapshot {
        sample(&self.probe, &self.latest, self.gpu_timeout).await
    }

    /// Start the sampling loop. The first sample is taken immediately.
    pub fn start(&self) {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_some() {
            debug!("Resource sampler already running");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let probe = Arc::clone(&self.probe);
        let latest = Arc::clone(&self.latest);
        let interval = self.interval;
        let gpu_timeout = self.gpu_timeout;

        let handle = tokio::spawn(async move {
            info!("Starting resource sampler: interval={:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = sample(&probe, &latest, gpu_timeout).await;
                        debug!(
                            "Sampled resources: cpu={:.1}% mem={:.1}% gpus={}",
                            snapshot.cpu_percent,
                            snapshot.memory_percent(),
                            snapshot.gpus.len()
                        );
                    }
                }
            }
            info!("Resource sampler stopped");
        });

        *task = Some(SamplerTask { cancel, handle });
    }

    /// Stop the sampling loop, waiting for an in-flight tick to finish
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("Resource sampler task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the sampling loop is running
    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}

async fn sample(
    probe: &Arc<Mutex<HostProbe>>,
    latest: &Arc<Mutex<ResourceSnapshot>>,
    gpu_timeout: Duration,
) -> ResourceSnapshot {
    let gpus = gpu::probe_gpus(gpu_timeout).await;

    let probe = Arc::clone(probe);
    let measured = tokio::task::spawn_blocking(move || match probe.lock() {
        Ok(mut host) => host.measure(gpus),
        Err(poisoned) => poisoned.into_inner().measure(gpus),
    })
    .await;

    let snapshot = match measured {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Resource measurement failed: {}", e);
            ResourceSnapshot::default()
        }
    };

    match latest.lock() {
        Ok(mut guard) => *guard = snapshot.clone(),
        Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(util: f64, total: u64) -> GpuInfo {
        GpuInfo {
            index: 0,
            name: "test".to_string(),
            vendor: GpuVendor::Nvidia,
            utilization_percent: util,
            memory_used_bytes: 0,
            memory_total_bytes: total,
            temperature_celsius: 0.0,
            power_draw_watts: 0.0,
        }
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot = ResourceSnapshot::default();
        assert_eq!(snapshot.cpu_percent, 0.0);
        assert_eq!(snapshot.memory_percent(), 0.0);
        assert_eq!(snapshot.disk_percent(), 0.0);
        assert_eq!(snapshot.gpu_percent(), 0.0);
        assert_eq!(snapshot.gpu_memory_total_bytes(), 0);
    }

    #[test]
    fn test_snapshot_percentages() {
        let snapshot = ResourceSnapshot {
            memory_used_bytes: 25,
            memory_total_bytes: 100,
            disk_used_bytes: 1,
            disk_total_bytes: 4,
            gpus: vec![gpu(20.0, 8), gpu(60.0, 16)],
            ..Default::default()
        };
        assert_eq!(snapshot.memory_percent(), 25.0);
        assert_eq!(snapshot.disk_percent(), 25.0);
        assert_eq!(snapshot.gpu_percent(), 40.0);
        assert_eq!(snapshot.gpu_memory_total_bytes(), 24);
    }

    #[test]
    fn test_unstarted_sampler_returns_default() {
        let sampler = ResourceSampler::new(Duration::from_secs(60));
        let snapshot = sampler.snapshot();
        assert!(snapshot.gpus.is_empty());
        assert_eq!(snapshot.memory_total_bytes, 0);
        assert!(!sampler.is_running());
    }

    #[tokio::test]
    async fn test_sample_once_never_panics() {
        let sampler = ResourceSampler::new(Duration::from_secs(60))
            .with_gpu_timeout(Duration::from_secs(2));
        let snapshot = sampler.sample_once().await;

        assert!(snapshot.cpu_percent >= 0.0);
        assert!(snapshot.memory_total_bytes > 0);
        assert!(snapshot.disk_used_bytes <= snapshot.disk_total_bytes);
        for g in &snapshot.gpus {
            assert!(g.utilization_percent >= 0.0);
        }
        assert_eq!(sampler.snapshot(), snapshot);
    }

    #[test]
    fn test_missing_disk_path_falls_back_to_zero() {
        let disks = Disks::new_with_refreshed_list();
        assert_eq!(disk_usage(&disks, Path::new("relative/path")), (0, 0));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let sampler = ResourceSampler::new(Duration::from_millis(50))
            .with_gpu_timeout(Duration::from_secs(2));
        sampler.start();
        sampler.start();
        assert!(sampler.is_running());

        // First sample fires immediately
        let mut sampled = false;
        for _ in 0..100 {
            if sampler.snapshot().memory_total_bytes > 0 {
                sampled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(sampled);

        sampler.stop().await;
        assert!(!sampler.is_running());
        sampler.stop().await;
    }
}
