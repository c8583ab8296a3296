//! File-based handshake between detached workers and the manager's poller.
//!
//! A worker writes exactly one JSON document to `<status_dir>/<operation_id>.json`
//! once it reaches a terminal state. Presence plus a successful parse is the
//! only terminal signal; the ledger, not the artifact, is the durable outcome.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bgops_core::{
    current_unix_timestamp_ms, format_unix_ms_rfc3339, parse_rfc3339_unix_ms, write_text_atomic,
};
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::operation::{ErrorInfo, ResultSummary};

/// Terminal status reported by a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    Succeeded,
    Failed,
}

/// Wire format of a status artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusArtifact {
    pub operation_id: String,
    pub status: ArtifactStatus,
    /// ISO 8601 completion time.
    pub finished_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl StatusArtifact {
    pub fn succeeded(operation_id: impl Into<String>, summary: ResultSummary) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: ArtifactStatus::Succeeded,
            finished_at: format_unix_ms_rfc3339(current_unix_timestamp_ms()),
            result_summary: Some(summary),
            error_info: None,
        }
    }

    pub fn failed(operation_id: impl Into<String>, error_info: ErrorInfo) -> Self {
        Self {
            operation_id: operation_id.into(),
            status: ArtifactStatus::Failed,
            finished_at: format_unix_ms_rfc3339(current_unix_timestamp_ms()),
            result_summary: None,
            error_info: Some(error_info),
        }
    }

    pub fn finished_unix_ms(&self) -> Option<u64> {
        parse_rfc3339_unix_ms(&self.finished_at)
    }
}

/// Outcome of checking one operation's artifact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactProbe {
    /// Worker still running or not yet flushed its result.
    Absent,
    Ready(StatusArtifact),
    /// File exists but cannot be used; carries a human-readable reason.
    Malformed(String),
}

pub fn status_artifact_path(status_dir: &Path, operation_id: &str) -> PathBuf {
    status_dir.join(format!("{operation_id}.json"))
}

/// Worker side: atomically publishes `artifact` at `path`.
pub fn write_status_artifact(path: &Path, artifact: &StatusArtifact) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(artifact).context("failed to encode status artifact")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
        .with_context(|| format!("failed to publish status artifact {}", path.display()))
}

/// Reads and validates the artifact for `expected_operation_id`.
///
/// Returns `Ok(None)` when no artifact exists yet.
pub fn read_status_artifact(
    path: &Path,
    expected_operation_id: &str,
) -> Result<Option<StatusArtifact>, ArtifactError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let artifact =
        serde_json::from_str::<StatusArtifact>(&raw).map_err(|error| ArtifactError::Malformed {
            path: path.to_path_buf(),
            detail: error.to_string(),
        })?;
    if artifact.operation_id != expected_operation_id {
        return Err(ArtifactError::OperationMismatch {
            path: path.to_path_buf(),
            expected: expected_operation_id.to_string(),
            found: artifact.operation_id,
        });
    }
    Ok(Some(artifact))
}

/// Non-failing variant of [`read_status_artifact`] used by the poller.
pub fn probe_status_artifact(path: &Path, expected_operation_id: &str) -> ArtifactProbe {
    match read_status_artifact(path, expected_operation_id) {
        Ok(None) => ArtifactProbe::Absent,
        Ok(Some(artifact)) => ArtifactProbe::Ready(artifact),
        Err(error) => ArtifactProbe::Malformed(error.to_string()),
    }
}

/// Deletes a processed artifact. A missing file counts as already consumed.
pub fn consume_status_artifact(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to consume status artifact {}", path.display()))
        }
    }
}
