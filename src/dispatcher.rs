// src/dispatcher.rs
//
// =============================================================================
// STRATUS: DISPATCHER
// =============================================================================
//
// Front-end glue between a validated request and the background machinery.
//
// Accepting a compute job: create the row, materialize the workspace,
// consult the admission controller, and either submit to the worker queue
// or park the payload in the registry. The caller gets the task row back
// immediately; a missing GPU slice is not an error.
//
// This module also owns the owner-checked read side (task fetch/list,
// files, download, tree, stored logs) and the terminal-only delete.

use crate::core::{
    container_name, ComputeTaskRequest, FileNode, JobPayload, Principal, Task, TaskStatus,
    TaskType, MOUNT_POINT,
};
use crate::error::CoreError;
use crate::queue::JobQueue;
use crate::registry::GpuRegistry;
use crate::runtime::ContainerRuntime;
use crate::store::TaskStore;
use crate::worker::CONTAINER_LOG_FILE;
use crate::workspace::{self, WorkspaceManager};

use std::path::PathBuf;
use std::sync::Arc;

/// Depth of the `/tree` listing.
const TREE_DEPTH: usize = 2;

pub struct Dispatcher {
    store: Arc<TaskStore>,
    workspaces: Arc<WorkspaceManager>,
    registry: Arc<dyn GpuRegistry>,
    queue: Arc<dyn JobQueue>,
    max_cpu: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        workspaces: Arc<WorkspaceManager>,
        registry: Arc<dyn GpuRegistry>,
        queue: Arc<dyn JobQueue>,
        max_cpu: u32,
    ) -> Self {
        Self {
            store,
            workspaces,
            registry,
            queue,
            max_cpu,
        }
    }

    // -------------------------------------------------------------------------
    // 1. JOB ACCEPTANCE
    // -------------------------------------------------------------------------

    pub async fn start_compute(
        &self,
        request: ComputeTaskRequest,
        principal: &Principal,
    ) -> Result<Task, CoreError> {
        if request.image.trim().is_empty() {
            return Err(CoreError::InvalidArgument("image must not be empty".into()));
        }

        let cpu_cores = request.resources.cpu.clamp(1, self.max_cpu);

        // The row first: it assigns the id the workspace name needs.
        // Status is `running` from the start; "accepted and will run" is
        // what the user observes, whether or not a GPU slice is free yet.
        let mut task = self
            .store
            .create_task(TaskType::Compute, TaskStatus::Running, principal.id)?;

        let workspace = self.workspaces.workspace_for(&principal.name, task.id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            let message = format!("Workspace creation failed: {}", e);
            self.store
                .set_status(task.id, TaskStatus::Failed, Some(&message))?;
            task.status = TaskStatus::Failed;
            task.logs = Some(message);
            return Ok(task);
        }

        let workspace_str = workspace.to_string_lossy().into_owned();
        self.store.set_path(task.id, &workspace_str)?;
        task.path = Some(workspace_str);

        let mut env = request.env.clone();
        env.insert("TASK_OUTPUT_DIR".to_string(), MOUNT_POINT.to_string());
        if request.command.is_none() {
            // No explicit command: tell the image's own entrypoint where
            // artifacts belong.
            env.entry("OUTPUT_DIR".to_string())
                .or_insert_with(|| MOUNT_POINT.to_string());
        }

        let payload = JobPayload {
            task_id: task.id,
            image: request.image,
            command: request.command,
            args: request.args,
            workspace,
            cpu_cores,
            gpu: request.resources.gpu,
            env,
        };

        if payload.gpu {
            if self.registry.try_acquire(task.id).await? {
                self.queue.submit(payload).await?;
            } else {
                log::info!("GPU budget exhausted, parking task {}", task.id);
                self.registry.enqueue(task.id, payload).await?;
            }
        } else {
            self.queue.submit(payload).await?;
        }

        Ok(task)
    }

    // -------------------------------------------------------------------------
    // 2. OWNER-CHECKED READS
    // -------------------------------------------------------------------------

    /// Fetch a task the principal owns. A foreign or unknown id answers
    /// the same way, so existence is not leaked across tenants.
    pub fn owned_task(&self, principal: &Principal, task_id: i64) -> Result<Task, CoreError> {
        match self.store.get_task(task_id)? {
            Some(task) if task.user_id == principal.id => Ok(task),
            _ => Err(CoreError::NotFound("Task")),
        }
    }

    pub fn list_tasks(&self, principal: &Principal) -> Result<Vec<Task>, CoreError> {
        Ok(self.store.tasks_for_user(principal.id)?)
    }

    pub fn list_task_files(
        &self,
        principal: &Principal,
        task_id: i64,
        rel_path: &str,
    ) -> Result<Vec<FileNode>, CoreError> {
        self.owned_task(principal, task_id)?;
        let base = self.workspaces.workspace_for(&principal.name, task_id);
        let target = workspace::ensure_is_subpath(&base, rel_path)?;
        if !target.is_dir() {
            return Err(CoreError::InvalidArgument("Not a directory".into()));
        }
        Ok(workspace::list_dir(&target))
    }

    /// Resolve a file for download. The handler serves the bytes.
    pub fn download_path(
        &self,
        principal: &Principal,
        task_id: i64,
        rel_path: &str,
    ) -> Result<PathBuf, CoreError> {
        self.owned_task(principal, task_id)?;
        let base = self.workspaces.workspace_for(&principal.name, task_id);
        let target = workspace::ensure_is_subpath(&base, rel_path)?;
        if !target.is_file() {
            return Err(CoreError::NotFound("File"));
        }
        Ok(target)
    }

    pub fn workspace_tree(
        &self,
        principal: &Principal,
        task_id: i64,
    ) -> Result<Vec<FileNode>, CoreError> {
        self.owned_task(principal, task_id)?;
        let base = self.workspaces.workspace_for(&principal.name, task_id);
        if !base.exists() {
            return Ok(Vec::new());
        }
        Ok(workspace::tree(&base, TREE_DEPTH))
    }

    /// The stored blob for terminal tasks; the live tee for running ones.
    pub fn task_logs(&self, principal: &Principal, task_id: i64) -> Result<String, CoreError> {
        let task = self.owned_task(principal, task_id)?;
        if let Some(logs) = task.logs {
            return Ok(logs);
        }
        let tee = self
            .workspaces
            .workspace_for(&principal.name, task_id)
            .join(CONTAINER_LOG_FILE);
        match std::fs::read_to_string(&tee) {
            Ok(content) => Ok(content),
            Err(_) => Err(CoreError::NotFound("Log")),
        }
    }

    // -------------------------------------------------------------------------
    // 3. DELETE
    // -------------------------------------------------------------------------

    /// Remove container + workspace + row. Only terminal tasks qualify;
    /// stopping a running task is an out-of-band kill, not a delete.
    pub async fn delete_task(
        &self,
        principal: &Principal,
        task_id: i64,
    ) -> Result<(), CoreError> {
        let task = self.owned_task(principal, task_id)?;
        if !task.status.is_terminal() {
            return Err(CoreError::Conflict("Task is not in a terminal state".into()));
        }

        // The container must be gone before the workspace goes.
        let runtime = ContainerRuntime::connect()?;
        runtime
            .remove(&container_name(task.user_id, task.id))
            .await?;

        let workspace = self.workspaces.workspace_for(&principal.name, task_id);
        if workspace.exists() {
            tokio::fs::remove_dir_all(&workspace).await?;
        }

        self.store.delete_task(task_id)?;
        log::info!("Task {} deleted by user {}", task_id, principal.id);
        Ok(())
    }
}
