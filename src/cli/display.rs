//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::ValidationResult;
use crate::metrics::ResourceSnapshot;
use crate::runtime::ScanReport;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let render = |cells: Vec<String>| {
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                line.push_str("   ");
            }
            match widths.get(i) {
                Some(width) => line.push_str(&format!("{:width$}", cell, width = *width)),
                None => line.push_str(cell),
            }
        }
        line.trim_end().to_string() + "\n"
    };

    let mut output = render(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        output.push_str(&render(row));
    }
    output
}

/// Human-readable byte count (binary units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

// ============================================================================
// Resource display
// ============================================================================

/// Format a resource snapshot for display
pub fn format_resources(snapshot: &ResourceSnapshot) -> String {
    let mut output = String::new();

    output.push_str(&format!("CPU:     {:.1}%\n", snapshot.cpu_percent));
    output.push_str(&format!(
        "Memory:  {} / {} ({:.1}%)\n",
        format_bytes(snapshot.memory_used_bytes),
        format_bytes(snapshot.memory_total_bytes),
        snapshot.memory_percent()
    ));
    output.push_str(&format!(
        "Disk:    {} / {} ({:.1}%)\n",
        format_bytes(snapshot.disk_used_bytes),
        format_bytes(snapshot.disk_total_bytes),
        snapshot.disk_percent()
    ));
    output.push_str(&format!("Uptime:  {}s\n", snapshot.uptime_secs));

    if snapshot.gpus.is_empty() {
        output.push_str("GPUs:    none detected\n");
        return output;
    }

    output.push_str("\nGPUs:\n");
    let headers = &["#", "NAME", "VENDOR", "UTIL", "MEMORY", "TEMP", "POWER"];
    let rows = snapshot
        .gpus
        .iter()
        .map(|gpu| {
            vec![
                gpu.index.to_string(),
                gpu.name.clone(),
                format!("{:?}", gpu.vendor).to_lowercase(),
                format!("{:.0}%", gpu.utilization_percent),
                format!(
                    "{} / {}",
                    format_bytes(gpu.memory_used_bytes),
                    format_bytes(gpu.memory_total_bytes)
                ),
                format!("{:.0}C", gpu.temperature_celsius),
                format!("{:.0}W", gpu.power_draw_watts),
            ]
        })
        .collect();
    output.push_str(&format_table(headers, rows));
    output
}

// ============================================================================
// Scan display
// ============================================================================

/// Format a model scan report for display
pub fn format_scan_report(report: &ScanReport) -> String {
    let headers = &["ID", "SIZE", "PATH"];
    let rows = report
        .models
        .iter()
        .map(|m| {
            vec![
                m.id.clone(),
                format_bytes(m.size_bytes),
                m.path.display().to_string(),
            ]
        })
        .collect();

    let mut output = format_table(headers, rows);
    output.push_str(&format!(
        "\n{} model(s) in {} file(s), {}ms\n",
        report.models.len(),
        report.total_files,
        report.duration_ms
    ));

    for issue in &report.errors {
        output.push_str(&format!("  ! {}: {}\n", issue.path.display(), issue.error));
    }
    output
}

// ============================================================================
// Validation display
// ============================================================================

/// Format validation result for display
pub fn format_validation_result(result: &ValidationResult, path: &str) -> String {
    let mut output = String::new();

    if result.valid {
        output.push_str(&format!("✓ {} is valid\n\n", path));
        if let Some(ref id) = result.node_id {
            output.push_str(&format!("  Node:        {}\n", id));
        }
        if let Some(ref url) = result.coordinator_url {
            output.push_str(&format!("  Coordinator: {}\n", url));
        }
        output.push_str(&format!("  Model dirs:  {}\n", result.model_dirs));
    } else {
        output.push_str(&format!("✗ {} is invalid\n\n", path));
        if let Some(ref error) = result.error {
            output.push_str(&format!("  Error: {}\n", error));
        }
    }

    output
}
