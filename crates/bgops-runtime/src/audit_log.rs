use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bgops_core::{
    append_line_with_rotation, current_unix_timestamp_ms, retained_log_files, LogRotationPolicy,
};
use serde::{Deserialize, Serialize};

use crate::operation::OperationRecord;

/// One line of the append-only `events.jsonl` audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub timestamp_unix_ms: u64,
    pub operation_id: String,
    pub event: String,
    pub state: String,
    pub reason_code: String,
    pub workspace_scope: String,
    pub content_digest: String,
    pub detail: String,
}

impl AuditEvent {
    pub fn for_record(record: &OperationRecord, event: &str, detail: impl Into<String>) -> Self {
        Self {
            timestamp_unix_ms: current_unix_timestamp_ms(),
            operation_id: record.operation_id.clone(),
            event: event.to_string(),
            state: record.state.as_str().to_string(),
            reason_code: record.reason_code.clone(),
            workspace_scope: record.workspace_scope.clone(),
            content_digest: record.content_digest.clone(),
            detail: detail.into(),
        }
    }
}

/// Size-rotated NDJSON audit log. Write failures are logged, never returned.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    policy: LogRotationPolicy,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_policy(path, LogRotationPolicy::from_env())
    }

    pub fn with_policy(path: impl Into<PathBuf>, policy: LogRotationPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn append(&self, event: &AuditEvent) {
        if let Err(error) = self.try_append(event) {
            tracing::warn!(
                path = %self.path.display(),
                operation_id = %event.operation_id,
                event = %event.event,
                error = %format!("{error:#}"),
                "failed to append audit event"
            );
        }
    }

    fn try_append(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to encode audit event")?;
        append_line_with_rotation(self.path.as_path(), &line, self.policy)
    }

    /// Every retained event, oldest rotated generation first.
    pub fn read_events(&self) -> Result<Vec<AuditEvent>> {
        let mut events = Vec::new();
        for file in retained_log_files(self.path.as_path(), self.policy) {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                let event = serde_json::from_str::<AuditEvent>(line)
                    .with_context(|| format!("failed to parse audit line in {}", file.display()))?;
                events.push(event);
            }
        }
        Ok(events)
    }
}
