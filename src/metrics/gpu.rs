//! Best-effort GPU probing
//!
//! GPU telemetry is optional: every probe is bounded by a timeout and any
//! failure (missing tool, driver error, unparsable output) collapses to an
//! empty list rather than an error.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// GPU vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
}

/// Point-in-time measurement of a single GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub vendor: GpuVendor,
    pub utilization_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub temperature_celsius: f64,
    pub power_draw_watts: f64,
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

/// Parse `nvidia-smi --query-gpu=index,name,utilization.gpu,memory.used,
/// memory.total,temperature.gpu,power.draw --format=csv,noheader,nounits`.
///
/// Fields nvidia-smi reports as `[N/A]` become zero. Lines with fewer than
/// seven fields are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 7 {
                return None;
            }
            Some(GpuInfo {
                index: parts[0].parse().ok()?,
                name: parts[1].to_string(),
                vendor: GpuVendor::Nvidia,
                utilization_percent: parse_f64(parts[2]),
                memory_used_bytes: parse_u64(parts[3]) * MIB,
                memory_total_bytes: parse_u64(parts[4]) * MIB,
                temperature_celsius: parse_f64(parts[5]),
                power_draw_watts: parse_f64(parts[6]),
            })
        })
        .collect()
}

/// Parse `rocm-smi --showuse --showmeminfo vram --showtemp --showpower
/// --showproductname --json`.
///
/// rocm-smi key names drift between releases, so values are matched by key
/// fragments rather than exact names.
pub fn parse_rocm_smi(output: &str) -> Vec<GpuInfo> {
    let Ok(Value::Object(cards)) = serde_json::from_str::<Value>(output) else {
        return Vec::new();
    };

    let mut gpus: Vec<GpuInfo> = cards
        .iter()
        .filter_map(|(card, fields)| {
            let index = card.strip_prefix("card")?.parse().ok()?;
            let fields = fields.as_object()?;
            let find = |fragment: &str| {
                fields
                    .iter()
                    .find(|(k, _)| k.contains(fragment))
                    .and_then(|(_, v)| v.as_str())
                    .unwrap_or("")
            };

            let name = [find("Card series"), find("Card model")]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("AMD GPU")
                .to_string();

            Some(GpuInfo {
                index,
                name,
                vendor: GpuVendor::Amd,
                utilization_percent: parse_f64(find("GPU use")),
                memory_used_bytes: parse_u64(find("VRAM Total Used Memory")),
                memory_total_bytes: parse_u64(find("VRAM Total Memory")),
                temperature_celsius: parse_f64(find("Temperature")),
                power_draw_watts: parse_f64(find("Power")),
            })
        })
        .collect();

    gpus.sort_by_key(|g| g.index);
    gpus
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

fn parse_u64(s: &str) -> u64 {
    let s = s.trim();
    s.parse::<u64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f as u64))
        .unwrap_or(0)
}

// ============================================================================
// I/O: vendor tool probes
// ============================================================================

/// Probe all known vendor tools and return whatever GPUs they report.
pub async fn probe_gpus(timeout: Duration) -> Vec<GpuInfo> {
    let mut gpus = probe_nvidia(timeout).await;
    gpus.extend(probe_amd(timeout).await);
    gpus
}

async fn probe_nvidia(timeout: Duration) -> Vec<GpuInfo> {
    #[cfg(feature = "gpu")]
    {
        let nvml = tokio::task::spawn_blocking(probe_nvml);
        if let Ok(Ok(gpus)) = tokio::time::timeout(timeout, nvml).await {
            if !gpus.is_empty() {
                return gpus;
            }
        }
    }

    let args = [
        "--query-gpu=index,name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw",
        "--format=csv,noheader,nounits",
    ];
    run_probe("nvidia-smi", &args, timeout)
        .await
        .map(|out| parse_nvidia_smi(&out))
        .unwrap_or_default()
}

async fn probe_amd(timeout: Duration) -> Vec<GpuInfo> {
    let args = [
        "--showuse",
        "--showmeminfo",
        "vram",
        "--showtemp",
        "--showpower",
        "--showproductname",
        "--json",
    ];
    run_probe("rocm-smi", &args, timeout)
        .await
        .map(|out| parse_rocm_smi(&out))
        .unwrap_or_default()
}

/// Run a probe tool, returning its stdout only if it exits successfully in time.
pub async fn run_probe(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, output).await {
        Ok(Ok(out)) if out.status.success() => {
            Some(String::from_utf8_lossy(&out.stdout).into_owned())
        }
        Ok(Ok(out)) => {
            debug!("{} exited with {}", program, out.status);
            None
        }
        Ok(Err(e)) => {
            debug!("{} unavailable: {}", program, e);
            None
        }
        Err(_) => {
            debug!("{} timed out after {:?}", program, timeout);
            None
        }
    }
}

/// Query NVIDIA GPUs through NVML (requires `gpu` feature)
#[cfg(feature = "gpu")]
fn probe_nvml() -> Vec<GpuInfo> {
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::Nvml;

    let Ok(nvml) = Nvml::init() else {
        return Vec::new();
    };
    let count = nvml.device_count().unwrap_or(0);

    (0..count)
        .filter_map(|index| {
            let device = nvml.device_by_index(index).ok()?;
            let memory = device.memory_info().ok();
            Some(GpuInfo {
                index,
                name: device.name().unwrap_or_default(),
                vendor: GpuVendor::Nvidia,
                utilization_percent: device
                    .utilization_rates()
                    .map(|u| u.gpu as f64)
                    .unwrap_or(0.0),
                memory_used_bytes: memory.as_ref().map(|m| m.used).unwrap_or(0),
                memory_total_bytes: memory.as_ref().map(|m| m.total).unwrap_or(0),
                temperature_celsius: device
                    .temperature(TemperatureSensor::Gpu)
                    .map(|t| t as f64)
                    .unwrap_or(0.0),
                // NVML reports milliwatts
                power_draw_watts: device
                    .power_usage()
                    .map(|mw| mw as f64 / 1000.0)
                    .unwrap_or(0.0),
            })
        })
        .collect()
}
