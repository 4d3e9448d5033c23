// src/config.rs
//
// =============================================================================
// STRATUS: RUNTIME CONFIGURATION
// =============================================================================
//
// Everything tunable in one struct. Values come from environment variables
// with built-in defaults; the CLI layer (main.rs) overrides the common ones.
//
// With no STRATUS_REDIS_URL the process runs self-contained: in-memory
// registry + queue and an in-process worker pool. With a broker URL the
// registry and queue live in redis and `stratus worker` processes can be
// scaled out separately.

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// SQLite task store path.
    pub db_path: PathBuf,
    /// Root of all per-user workspace trees.
    pub workspace_root: PathBuf,
    /// Broker / registry URL. None = single-process mode.
    pub redis_url: Option<String>,
    /// Total GPU budget in MiB.
    pub total_vram_mb: u64,
    /// Size of one allocation slice in MiB. A job takes exactly one.
    pub slice_mb: u64,
    /// Hard cap on requested CPU cores.
    pub max_cpu: u32,
    /// Concurrent container workers per worker process.
    pub worker_slots: usize,
}

impl Config {
    pub const DEFAULT_TOTAL_VRAM_MB: u64 = 8192;
    pub const DEFAULT_SLICE_MB: u64 = 2048;
    pub const DEFAULT_MAX_CPU: u32 = 4;

    pub fn from_env() -> Result<Self> {
        let bind_addr = var_or("STRATUS_BIND", "0.0.0.0:8000")
            .parse()
            .context("STRATUS_BIND is not a socket address")?;

        let total_vram_mb = parse_var("STRATUS_TOTAL_VRAM_MB", Self::DEFAULT_TOTAL_VRAM_MB)?;
        let slice_mb = parse_var("STRATUS_GPU_SLICE_MB", Self::DEFAULT_SLICE_MB)?;
        if slice_mb == 0 || slice_mb > total_vram_mb {
            anyhow::bail!(
                "GPU slice ({} MiB) must be non-zero and fit the budget ({} MiB)",
                slice_mb,
                total_vram_mb
            );
        }

        Ok(Self {
            bind_addr,
            db_path: PathBuf::from(var_or("STRATUS_DB", "stratus.db")),
            workspace_root: PathBuf::from(var_or("STRATUS_WORKSPACES", "./workspaces")),
            redis_url: env::var("STRATUS_REDIS_URL").ok().filter(|s| !s.is_empty()),
            total_vram_mb,
            slice_mb,
            max_cpu: parse_var("STRATUS_MAX_CPU", Self::DEFAULT_MAX_CPU)?,
            worker_slots: parse_var("STRATUS_WORKER_SLOTS", default_worker_slots())?,
        })
    }
}

/// Half the cores, at least two. Container work is I/O bound on the
/// runtime, so oversubscription buys nothing.
fn default_worker_slots() -> usize {
    (num_cpus::get() / 2).max(2)
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v.parse::<T>().with_context(|| format!("{} is invalid", key)),
        Err(_) => Ok(default),
    }
}
