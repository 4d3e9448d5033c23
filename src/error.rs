// src/error.rs
//
// =============================================================================
// STRATUS: BOUNDARY ERRORS
// =============================================================================
//
// The typed error surface of the core. Internal plumbing uses anyhow;
// everything that crosses the HTTP boundary is narrowed to CoreError so
// the status mapping stays in one place (http.rs).
//
// Resource exhaustion is deliberately NOT an error kind: a job that cannot
// get a GPU slice is parked, and the caller still sees a created task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad request body or query: rejected before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Client-supplied path escapes the task workspace.
    #[error("Invalid path")]
    InvalidPath,

    /// Missing or unreadable principal headers.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Unknown id, cross-owner access, or missing file. The message is
    /// what the client sees; cross-owner reads use the same text as a
    /// genuine miss so existence is not leaked.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Operation not valid in the task's current lifecycle state.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
