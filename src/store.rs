// src/store.rs
//
// =============================================================================
// STRATUS: TASK STORE
// =============================================================================
//
// The persistence layer for task rows.
//
// Architecture:
// - SQLite, hot fields as columns, connection per call.
// - WAL journaling: the front end and in-process workers share one file
//   and readers must not block on the writer.
// - Status writes go through a guarded transition: the lifecycle DAG is
//   enforced here, not trusted to callers. Terminal rows are immutable.

use crate::core::{Task, TaskStatus, TaskType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

pub struct TaskStore {
    path: PathBuf,
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                logs TEXT,
                path TEXT,
                created_at TEXT NOT NULL,
                user_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            COMMIT;",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).context("Failed to open task store")?;
        // Per-connection: contention between handlers and workers.
        conn.execute_batch("PRAGMA busy_timeout=10000; PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    // -------------------------------------------------------------------------
    // WRITE API
    // -------------------------------------------------------------------------

    /// Insert a new row. The database assigns the (monotonic) id.
    pub fn create_task(
        &self,
        task_type: TaskType,
        status: TaskStatus,
        user_id: i64,
    ) -> Result<Task> {
        let conn = self.conn()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO tasks (task_type, status, created_at, user_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                task_type.as_str(),
                status.as_str(),
                created_at.to_rfc3339(),
                user_id
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Task {
            id,
            task_type,
            status,
            logs: None,
            path: None,
            created_at,
            user_id,
        })
    }

    /// Record the workspace path. Set exactly once; later calls are no-ops.
    pub fn set_path(&self, task_id: i64, path: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET path = ?2 WHERE id = ?1 AND path IS NULL",
            params![task_id, path],
        )?;
        Ok(())
    }

    /// Guarded status transition. Returns false (and writes nothing) when
    /// the step is not an edge of the lifecycle DAG, in particular when
    /// the row is already terminal. `logs`, when given, replaces the blob.
    pub fn set_status(
        &self,
        task_id: i64,
        status: TaskStatus,
        logs: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(current) = current.and_then(|s| TaskStatus::parse(&s)) else {
            return Ok(false);
        };
        if !current.can_transition_to(status) {
            return Ok(false);
        }

        tx.execute(
            "UPDATE tasks SET status = ?2, logs = COALESCE(?3, logs) WHERE id = ?1",
            params![task_id, status.as_str(), logs],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Remove the row. Callers verify terminal status first (dispatcher).
    pub fn delete_task(&self, task_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // READ API
    // -------------------------------------------------------------------------

    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                "SELECT id, task_type, status, logs, path, created_at, user_id
                 FROM tasks WHERE id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn tasks_for_user(&self, user_id: i64) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, task_type, status, logs, path, created_at, user_id
             FROM tasks WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_task)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let type_str: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let created_str: String = row.get(5)?;

    Ok(Task {
        id: row.get(0)?,
        task_type: TaskType::parse(&type_str).unwrap_or(TaskType::Compute),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        logs: row.get(3)?,
        path: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        user_id: row.get(6)?,
    })
}
