// src/monitor.rs
//
// =============================================================================
// STRATUS: HOST RESOURCE MONITOR
// =============================================================================
//
// Snapshots for the status WebSockets: CPU and memory from sysinfo,
// per-GPU stats from nvidia-smi. Hosts without a GPU simply report an
// empty list.

use serde::Serialize;
use std::process::Command;
use sysinfo::System;

#[derive(Debug, Clone, Serialize)]
pub struct GpuStat {
    pub id: u32,
    pub name: String,
    /// Utilization percent.
    pub load: f64,
    /// MiB.
    pub vram_used: u64,
    pub vram_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// CPU utilization percent across all cores.
    pub cpu: f32,
    /// Memory utilization percent.
    pub memory: f32,
    pub gpu: Vec<GpuStat>,
}

pub struct SystemMonitor {
    sys: System,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// CPU usage is measured between consecutive calls; hold one monitor
    /// per subscriber and call this every tick.
    pub fn snapshot(&mut self) -> ResourceStatus {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        let memory = if total > 0 {
            (self.sys.used_memory() as f32 / total as f32) * 100.0
        } else {
            0.0
        };

        ResourceStatus {
            cpu: self.sys.global_cpu_usage(),
            memory,
            gpu: query_gpus(),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// NVIDIA QUERIES
// ============================================================================

fn query_gpus() -> Vec<GpuStat> {
    let Ok(output) = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,utilization.gpu,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
    else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 5 {
                return None;
            }
            Some(GpuStat {
                id: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                load: fields[2].parse().ok()?,
                vram_used: fields[3].parse().ok()?,
                vram_total: fields[4].parse().ok()?,
            })
        })
        .collect()
}

/// Free VRAM (MiB) of the first GPU, None when no GPU is queryable.
pub fn gpu_free_vram() -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}
