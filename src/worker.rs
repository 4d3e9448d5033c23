// src/worker.rs
//
// =============================================================================
// STRATUS: CONTAINER WORKER
// =============================================================================
//
// The background executor.
//
// Responsibilities:
// 1. Pull job payloads off the worker queue, one per unit of work.
// 2. Drive the container lifecycle: create -> start -> stream logs ->
//    wait -> terminal status.
// 3. Guaranteed teardown: release the GPU slice (waking the next parked
//    job) and force-remove the container, on every path.
//
// A payload whose task is already terminal is a redelivered duplicate and
// is dropped before any runtime work.

use crate::core::{container_name, JobPayload, TaskStatus, MOUNT_POINT};
use crate::queue::JobQueue;
use crate::registry::GpuRegistry;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::TaskStore;

use anyhow::Result;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

/// Name of the per-workspace live log tee.
pub const CONTAINER_LOG_FILE: &str = "container.log";

struct RunOutcome {
    exit_code: i64,
    logs: String,
}

pub struct ContainerWorker {
    store: Arc<TaskStore>,
    registry: Arc<dyn GpuRegistry>,
    queue: Arc<dyn JobQueue>,
}

impl ContainerWorker {
    pub fn new(
        store: Arc<TaskStore>,
        registry: Arc<dyn GpuRegistry>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
        }
    }

    // -------------------------------------------------------------------------
    // 1. FLEET
    // -------------------------------------------------------------------------

    /// Run `slots` consumer loops until the shutdown flag flips.
    pub async fn run_fleet(self: Arc<Self>, slots: usize, shutdown: Arc<AtomicBool>) {
        let mut handles = Vec::with_capacity(slots);
        for slot in 0..slots {
            let worker = self.clone();
            let stop = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker.consume_loop(slot, stop).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn consume_loop(&self, slot: usize, stop: Arc<AtomicBool>) {
        log::info!("Worker slot {} online", slot);

        while !stop.load(Ordering::SeqCst) {
            match self.queue.next().await {
                Ok(Some(payload)) => {
                    log::info!("Slot {} picked up task {}", slot, payload.task_id);
                    self.process(payload).await;
                }
                Ok(None) => {
                    // Idle tick (pop timeout, or a closed in-memory channel).
                    sleep(Duration::from_millis(200)).await;
                }
                Err(e) => {
                    log::error!("Slot {} queue pop failed: {}", slot, e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        log::info!("Worker slot {} stopped", slot);
    }

    // -------------------------------------------------------------------------
    // 2. PER-PAYLOAD LIFECYCLE
    // -------------------------------------------------------------------------

    /// Run one payload to its terminal state. Never returns an error: every
    /// failure becomes a terminal task status, and teardown always runs.
    pub async fn process(&self, payload: JobPayload) {
        // Redelivery guard: read the row before touching the runtime.
        let task = match self.store.get_task(payload.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                log::warn!("Dropping payload for unknown task {}", payload.task_id);
                return;
            }
            Err(e) => {
                log::error!("Task {} row unreadable, leaving payload: {}", payload.task_id, e);
                return;
            }
        };
        if task.status.is_terminal() {
            log::warn!(
                "Task {} already {}, dropping redelivered payload",
                task.id,
                task.status
            );
            return;
        }

        let name = container_name(task.user_id, task.id);
        let gpu = payload.gpu;

        let (outcome, runtime, container_id) = match ContainerRuntime::connect() {
            Ok(runtime) => {
                let mut container_id = None;
                let outcome = self
                    .drive(&runtime, &payload, &name, &mut container_id)
                    .await;
                (outcome, Some(runtime), container_id)
            }
            Err(e) => (Err(e), None, None),
        };

        // Terminal status. The only lifecycle signal clients observe.
        match outcome {
            Ok(out) => {
                let status = if out.exit_code == 0 {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                self.finish(task.id, status, &out.logs);
                log::info!("Task {} finished: {} (exit {})", task.id, status, out.exit_code);
            }
            Err(e) => {
                self.finish(task.id, TaskStatus::Failed, &format!("Worker error: {}", e));
                log::error!("Task {} failed: {}", task.id, e);
            }
        }

        // Guaranteed teardown, both halves even if the run errored out.
        if gpu {
            match self.registry.release(payload.task_id).await {
                Ok(Some(next)) => {
                    log::info!("GPU slice freed, waking task {}", next.task_id);
                    if let Err(e) = self.queue.submit(next).await {
                        log::error!("Failed to dispatch woken payload: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("GPU release for task {} failed: {}", task.id, e),
            }
        }
        if let Some(runtime) = runtime {
            let target = container_id.as_deref().unwrap_or(&name);
            if let Err(e) = runtime.remove(target).await {
                log::warn!("Failed to remove container {}: {}", target, e);
            }
        }
    }

    /// Steps 2..7 of the lifecycle. `container_id` is written as soon as a
    /// container exists so teardown can target it even on later failures.
    async fn drive(
        &self,
        runtime: &ContainerRuntime,
        payload: &JobPayload,
        name: &str,
        container_id: &mut Option<String>,
    ) -> Result<RunOutcome> {
        tokio::fs::create_dir_all(&payload.workspace).await?;

        let mut env: Vec<String> = payload
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if !payload.env.contains_key("TASK_OUTPUT_DIR") {
            env.push(format!("TASK_OUTPUT_DIR={}", MOUNT_POINT));
        }

        let command = payload.command.clone().map(|mut cmd| {
            cmd.extend(payload.args.clone().unwrap_or_default());
            cmd
        });

        let spec = ContainerSpec {
            image: payload.image.clone(),
            command,
            env,
            bind: format!("{}:{}:rw", payload.workspace.display(), MOUNT_POINT),
            cpu_cores: payload.cpu_cores,
            gpu: payload.gpu,
        };

        let id = runtime.create_and_start(name, spec).await?;
        *container_id = Some(id.clone());

        // Live tee into the workspace; the accumulator becomes the blob.
        let mut tee = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(payload.workspace.join(CONTAINER_LOG_FILE))
            .await
            .ok();

        let mut accumulated: Vec<String> = Vec::new();
        let mut stream = runtime.log_stream(&id);
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(output) => {
                    let line = String::from_utf8_lossy(&output.into_bytes())
                        .trim_end()
                        .to_string();
                    if let Some(file) = tee.as_mut() {
                        let _ = file.write_all(line.as_bytes()).await;
                        let _ = file.write_all(b"\n").await;
                    }
                    accumulated.push(line);
                }
                Err(e) => {
                    // Frames after a stream drop are not recovered.
                    log::warn!("Log stream for task {} dropped: {}", payload.task_id, e);
                    break;
                }
            }
        }

        let exit_code = runtime.wait_exit(&id).await?;
        Ok(RunOutcome {
            exit_code,
            logs: accumulated.join("\n"),
        })
    }

    fn finish(&self, task_id: i64, status: TaskStatus, logs: &str) {
        match self.store.set_status(task_id, status, Some(logs)) {
            Ok(true) => {}
            Ok(false) => {
                // Lost a redelivery race; the earlier delivery already
                // wrote the terminal state.
                log::warn!("Task {} was terminal before {} write", task_id, status);
            }
            Err(e) => log::error!("Failed to persist status for task {}: {}", task_id, e),
        }
    }
}
