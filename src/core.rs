// src/core.rs
//
// =============================================================================
// STRATUS: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The data contracts of the control plane.
// This file defines the strict shapes shared between the HTTP front end,
// the dispatcher, the broker, and the container workers.
//
// Design Principles:
// 1. One source of truth: every wire/db/queue shape lives here.
// 2. Status is a closed DAG: pending -> running -> {completed, failed}.
// 3. The container name is identity: `user<owner>_task<id>` is both the
//    lookup key for live-log streaming and the redelivery guard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// In-container mount point of the task workspace.
pub const MOUNT_POINT: &str = "/workspaces";

/// Deterministic container name for a task.
/// Used by the worker (redelivery guard), the log bridge (lookup),
/// and delete (cleanup verification).
pub fn container_name(owner_id: i64, task_id: i64) -> String {
    format!("user{}_task{}", owner_id, task_id)
}

// ============================================================================
// 1. TASK LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Compute,
    StaticPage,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Compute => "compute",
            TaskType::StaticPage => "staticpage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compute" => Some(TaskType::Compute),
            "staticpage" => Some(TaskType::StaticPage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal states are immutable once written.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The lifecycle DAG. Self-transitions are not steps.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Completed | TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed | TaskStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task row. Doubles as the API response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub logs: Option<String>,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub user_id: i64,
}

// ============================================================================
// 2. PRINCIPAL
// ============================================================================

/// The authenticated identity attached to a request by the fronting
/// auth layer. The core never verifies credentials itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub name: String,
}

// ============================================================================
// 3. JOB REQUEST & PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default)]
    pub gpu: bool,
}

fn default_cpu() -> u32 {
    2
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            gpu: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeTaskRequest {
    pub image: String,
    /// If omitted, the image's own CMD/ENTRYPOINT runs.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Extra args appended to `command`.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
}

/// The serialized job description handed from Dispatcher to Worker
/// across the broker (or parked in the GPU queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub task_id: i64,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub workspace: PathBuf,
    pub cpu_cores: u32,
    pub gpu: bool,
    pub env: HashMap<String, String>,
}

// ============================================================================
// 4. FILE LISTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    /// None for directories.
    pub size: Option<u64>,
}
