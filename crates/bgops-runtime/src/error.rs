use std::path::PathBuf;

use thiserror::Error;

/// Machine-readable code callers map to "try again shortly".
pub const CAPACITY_EXCEEDED_CODE: &str = "429_BACKLOG";
const LAUNCH_FAILED_CODE: &str = "LAUNCH_FAILED";
const INVALID_REQUEST_CODE: &str = "INVALID_REQUEST";

/// Synchronous failures returned by `BackgroundOperationManager::stage`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("invalid stage request: {0}")]
    InvalidRequest(String),
    #[error(
        "background backlog is full ({running} running, {queued} queued, capacity {capacity}); try again shortly"
    )]
    CapacityExceeded {
        running: usize,
        queued: usize,
        capacity: usize,
    },
    #[error("operation '{operation_id}' could not start: {source}")]
    Launch {
        operation_id: String,
        #[source]
        source: LaunchError,
    },
}

impl StageError {
    /// Stable code for agent-facing and UI callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => INVALID_REQUEST_CODE,
            Self::CapacityExceeded { .. } => CAPACITY_EXCEEDED_CODE,
            Self::Launch { .. } => LAUNCH_FAILED_CODE,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Worker spawn rejected before a process id existed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to spawn worker '{program}': {message}")]
pub struct LaunchError {
    pub program: String,
    pub message: String,
}

impl LaunchError {
    pub fn new(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            message: message.into(),
        }
    }
}

/// Failures reading a worker status artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read status artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed status artifact {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },
    #[error("status artifact {path} belongs to '{found}', expected '{expected}'")]
    OperationMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}
