// src/main.rs
//
// =============================================================================
// STRATUS: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center of the control plane.
//
// Modes:
// 1. SERVE:  HTTP front end. Without a broker it also runs an in-process
//            worker pool, making one process a complete mini-cloud.
// 2. WORKER: A container worker fleet attached to the redis broker, scaled
//            out separately from the front end.
//
// Key Features:
// - Backend selection by configuration (in-memory vs redis).
// - Graceful shutdown handling.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;

use stratus::config::Config;
use stratus::dispatcher::Dispatcher;
use stratus::http::{self, AppState};
use stratus::queue::{JobQueue, MemoryQueue, RedisQueue};
use stratus::registry::{GpuRegistry, MemoryRegistry, RedisRegistry};
use stratus::store::TaskStore;
use stratus::worker::ContainerWorker;
use stratus::workspace::WorkspaceManager;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "stratus", version, about = "Mini-cloud control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP front end (self-contained without a broker).
    Serve {
        /// Listen address (default 0.0.0.0:8000).
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Redis URL for the shared registry and worker broker.
        #[arg(long)]
        redis_url: Option<String>,

        /// Task store path.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Workspace root directory.
        #[arg(long)]
        workspaces: Option<PathBuf>,

        /// Concurrent container workers (in-process pool only).
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run a container worker fleet attached to the broker.
    Worker {
        /// Redis URL for the shared registry and worker broker.
        #[arg(long)]
        redis_url: Option<String>,

        /// Task store path.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Concurrent container workers in this process.
        #[arg(long)]
        workers: Option<usize>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Commands::Serve {
            bind,
            redis_url,
            db,
            workspaces,
            workers,
        } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if redis_url.is_some() {
                config.redis_url = redis_url;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(root) = workspaces {
                config.workspace_root = root;
            }
            if let Some(workers) = workers {
                config.worker_slots = workers;
            }
            run_serve(config).await
        }
        Commands::Worker {
            redis_url,
            db,
            workers,
        } => {
            if redis_url.is_some() {
                config.redis_url = redis_url;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            if let Some(workers) = workers {
                config.worker_slots = workers;
            }
            run_worker(config).await
        }
    }
}

// ============================================================================
// 3. RUNTIME: FRONT END
// ============================================================================

async fn run_serve(config: Config) -> Result<()> {
    let store = Arc::new(TaskStore::open(&config.db_path)?);
    let workspaces = Arc::new(WorkspaceManager::new(&config.workspace_root)?);
    let (registry, queue) = build_backends(&config).await?;

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        workspaces,
        registry.clone(),
        queue.clone(),
        config.max_cpu,
    ));

    let shutdown = Arc::new(AtomicBool::new(false));

    // No external fleet: containers run in this process.
    if config.redis_url.is_none() {
        let worker = Arc::new(ContainerWorker::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
        ));
        let stop = shutdown.clone();
        let slots = config.worker_slots;
        log::info!("Starting in-process worker pool ({} slots)", slots);
        tokio::spawn(async move {
            worker.run_fleet(slots, stop).await;
        });
    }

    let app = http::router(AppState {
        dispatcher,
        store,
        registry,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    log::info!("Control plane listening on {}", config.bind_addr);

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal::ctrl_c().await.ok();
            log::warn!("Interrupt received. Stopping...");
            stop.store(true, Ordering::SeqCst);
        })
        .await?;

    log::info!("Front end shutdown complete");
    Ok(())
}

// ============================================================================
// 4. RUNTIME: WORKER FLEET
// ============================================================================

async fn run_worker(config: Config) -> Result<()> {
    config
        .redis_url
        .as_ref()
        .context("Worker mode needs a broker: set --redis-url or STRATUS_REDIS_URL")?;

    let store = Arc::new(TaskStore::open(&config.db_path)?);
    let (registry, queue) = build_backends(&config).await?;
    let worker = Arc::new(ContainerWorker::new(store, registry, queue));

    let shutdown = Arc::new(AtomicBool::new(false));
    let stop = shutdown.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("Interrupt received. Stopping...");
        stop.store(true, Ordering::SeqCst);
    });

    log::info!("Worker fleet online ({} slots)", config.worker_slots);
    worker.run_fleet(config.worker_slots, shutdown).await;
    log::info!("Worker shutdown complete");
    Ok(())
}

// ============================================================================
// 5. BACKEND SELECTION
// ============================================================================

async fn build_backends(config: &Config) -> Result<(Arc<dyn GpuRegistry>, Arc<dyn JobQueue>)> {
    match &config.redis_url {
        Some(url) => {
            log::info!("Registry and broker on redis at {}", url);
            let registry =
                RedisRegistry::connect(url, config.total_vram_mb, config.slice_mb).await?;
            let queue = RedisQueue::connect(url).await?;
            Ok((Arc::new(registry), Arc::new(queue)))
        }
        None => {
            log::info!("No broker configured; using in-memory registry and queue");
            Ok((
                Arc::new(MemoryRegistry::new(config.total_vram_mb, config.slice_mb)),
                Arc::new(MemoryQueue::new()),
            ))
        }
    }
}
