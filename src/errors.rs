//! Typed error hierarchy for the autodev engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — backlog file persistence failures
//! - `RunnerError` — agent subprocess failures
//! - `SchedulerError` — scheduling lifecycle failures
//!
//! `AuthzError` covers the path-authorization capability consumed by both
//! the store and the runner.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the work-item store's persistence path.
///
/// The store converts most file-level problems into recovered values or
/// logged no-ops; the variants here are the ones callers must see because
/// the write was refused or genuinely failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refusing to overwrite backlog at {path} with an empty collection")]
    RefusedEmptyWrite { path: PathBuf },

    #[error("Failed to create state directory at {path}: {source}")]
    StateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write backlog file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize backlog: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Authz(#[from] AuthzError),
}

/// Errors from the agent subprocess layer.
///
/// These never cross the stream boundary during a run — the runner reports
/// run failures as terminal records — but they are used for diagnostics and
/// by code that builds run requests.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn agent process '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error reading agent output: {0}")]
    StreamRead(#[source] std::io::Error),
}

/// Errors from path authorization.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("Path {path} is outside the allowed roots")]
    Denied { path: PathBuf },

    #[error("Failed to resolve path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the scheduler lifecycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}
