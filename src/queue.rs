// src/queue.rs
//
// =============================================================================
// STRATUS: WORKER QUEUE
// =============================================================================
//
// The handoff between the request-handling front end and the container
// workers. The front end only ever pushes; workers only ever pop. A payload
// is processed by exactly one worker per delivery, and the broker gives
// at-least-once semantics (the worker's redelivery guard handles the rest).
//
// Backends:
// - RedisQueue: RPUSH/BLPOP on the list named after the worker task, shared
//   by every process attached to the broker.
// - MemoryQueue: a tokio channel for single-process mode and tests.

use crate::core::JobPayload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};

/// Broker list name. Worker processes pop exactly this task.
pub const TASK_QUEUE_KEY: &str = "run_container_task";

/// How long a blocking pop waits before yielding an idle tick.
const POP_TIMEOUT_SECS: f64 = 5.0;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Hand a payload to the worker fleet.
    async fn submit(&self, payload: JobPayload) -> Result<()>;

    /// Pop the next payload. None is an idle tick (timeout or closed
    /// channel); callers loop.
    async fn next(&self) -> Result<Option<JobPayload>>;
}

// ============================================================================
// 1. IN-MEMORY BACKEND
// ============================================================================

pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<JobPayload>,
    rx: Mutex<mpsc::UnboundedReceiver<JobPayload>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, payload: JobPayload) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| anyhow::anyhow!("Worker queue closed"))
    }

    async fn next(&self) -> Result<Option<JobPayload>> {
        // One consumer at a time; competing workers take turns on the lock.
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

// ============================================================================
// 2. REDIS BACKEND
// ============================================================================

pub struct RedisQueue {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid redis URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to redis broker")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn submit(&self, payload: JobPayload) -> Result<()> {
        let mut conn = self.conn.clone();
        let frame = serde_json::to_string(&payload)?;
        conn.rpush::<_, _, ()>(TASK_QUEUE_KEY, frame).await?;
        Ok(())
    }

    async fn next(&self) -> Result<Option<JobPayload>> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(TASK_QUEUE_KEY, POP_TIMEOUT_SECS).await?;

        match popped {
            Some((_, frame)) => {
                let payload =
                    serde_json::from_str(&frame).context("Corrupt payload on worker queue")?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}
