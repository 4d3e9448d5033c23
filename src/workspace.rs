// src/workspace.rs
//
// =============================================================================
// STRATUS: WORKSPACE MANAGER
// =============================================================================
//
// Per-task directories under a per-user root, and the single sanctioned way
// to turn a client-supplied relative path into a filesystem path.
//
// Layout: <root>/<user_name>/task_<id>/
// The directory is bind-mounted into the task's container at /workspaces
// and retained after terminal status for artifact retrieval.

use crate::core::FileNode;
use crate::error::CoreError;
use std::fs;
use std::path::{Path, PathBuf};

pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Anchors the manager at an absolute root. The root directory is
    /// created eagerly so later canonicalization has something to resolve.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CoreError> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    /// The task's directory. Pure; does not create.
    pub fn workspace_for(&self, user_name: &str, task_id: i64) -> PathBuf {
        self.root.join(user_name).join(format!("task_{}", task_id))
    }
}

// ============================================================================
// 1. PATH SAFETY
// ============================================================================

/// Resolve `base/user_path` and verify it cannot escape `base`.
///
/// Symlinks are followed: the deepest existing ancestor of the joined path
/// is canonicalized and the remaining components re-appended, so both `..`
/// hops and symlink hops out of the workspace are caught by the prefix
/// check. Absolute inputs replace the base on join and fail the same check.
pub fn ensure_is_subpath(base: &Path, user_path: &str) -> Result<PathBuf, CoreError> {
    let base_real = fs::canonicalize(base).map_err(|_| CoreError::InvalidPath)?;
    let joined = base_real.join(user_path);

    let resolved = resolve_existing_prefix(&joined).map_err(|_| CoreError::InvalidPath)?;
    if !resolved.starts_with(&base_real) {
        return Err(CoreError::InvalidPath);
    }
    Ok(resolved)
}

/// Canonicalize the longest existing prefix of `path`, then re-append the
/// components that do not exist yet.
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            // Ran out of named components without finding anything on disk.
            None => return Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
        if !existing.pop() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        }
    }

    let mut real = fs::canonicalize(&existing)?;
    for part in tail.iter().rev() {
        real.push(part);
    }
    Ok(real)
}

// ============================================================================
// 2. LISTINGS
// ============================================================================

/// Direct children of `path`. Missing path yields an empty list; entries
/// whose stat fails (deleted mid-scan) are skipped.
pub fn list_dir(path: &Path) -> Vec<FileNode> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        items.push(FileNode {
            path: name.clone(),
            name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { None } else { Some(meta.len()) },
        });
    }
    items
}

/// Recursive listing below `base`, paths relative to `base`, limited to
/// `max_depth` directory levels.
pub fn tree(base: &Path, max_depth: usize) -> Vec<FileNode> {
    let mut out = Vec::new();
    walk(base, base, 0, max_depth, &mut out);
    out
}

fn walk(dir: &Path, base: &Path, depth: usize, max_depth: usize, out: &mut Vec<FileNode>) {
    if depth > max_depth {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let full = entry.path();
        let rel = full
            .strip_prefix(base)
            .unwrap_or(&full)
            .to_string_lossy()
            .into_owned();
        let name = entry.file_name().to_string_lossy().into_owned();

        if meta.is_dir() {
            out.push(FileNode {
                path: rel,
                name,
                is_dir: true,
                size: None,
            });
            walk(&full, base, depth + 1, max_depth, out);
        } else {
            out.push(FileNode {
                path: rel,
                name,
                is_dir: false,
                size: Some(meta.len()),
            });
        }
    }
}
