use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bgops_core::current_unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub(crate) const OPERATION_RECORD_SCHEMA_VERSION: u32 = 1;
const OPERATION_ID_PREFIX: &str = "op";
const CONTENT_DIGEST_HEX_LEN: usize = 12;

pub(crate) const REASON_PENDING: &str = "operation_pending";
pub(crate) const REASON_QUEUED: &str = "operation_queued";
pub(crate) const REASON_STARTED: &str = "operation_started";
pub(crate) const REASON_SUCCEEDED: &str = "operation_succeeded";
pub(crate) const REASON_WORKER_FAILED: &str = "operation_worker_failed";
pub(crate) const REASON_LAUNCH_FAILED: &str = "operation_launch_failed";
pub(crate) const REASON_ARTIFACT_TIMEOUT: &str = "operation_artifact_timeout";
pub(crate) const REASON_ARTIFACT_MALFORMED: &str = "operation_artifact_malformed";
pub(crate) const REASON_WORKER_EXITED: &str = "operation_worker_exited";
pub(crate) const REASON_RECONCILED_UNKNOWN: &str = "operation_reconciled_unknown";
pub(crate) const REASON_REQUEUED_AFTER_RESTART: &str = "operation_requeued_after_restart";
pub(crate) const REASON_NOT_RESUMABLE: &str = "operation_not_resumable";
pub(crate) const REASON_RESUMED_ALIVE: &str = "operation_resumed_alive";

pub(crate) const ERROR_CODE_LAUNCH_FAILED: &str = "LAUNCH_FAILED";
pub(crate) const ERROR_CODE_ARTIFACT_TIMEOUT: &str = "ARTIFACT_TIMEOUT";
pub(crate) const ERROR_CODE_ARTIFACT_MALFORMED: &str = "ARTIFACT_MALFORMED";
pub(crate) const ERROR_CODE_WORKER_EXITED: &str = "WORKER_EXITED";
pub(crate) const ERROR_CODE_RECONCILIATION_UNKNOWN: &str = "RECONCILIATION_UNKNOWN";
pub(crate) const ERROR_CODE_WORKER_FAILURE: &str = "WORKER_FAILURE";

static OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn operation_record_schema_version() -> u32 {
    OPERATION_RECORD_SCHEMA_VERSION
}

/// Lifecycle states of a background operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Record created by `stage`, admission decision not applied yet.
    Pending,
    /// Waiting in the FIFO queue for a running slot.
    Queued,
    /// Worker process launched and not yet observed terminal.
    Running,
    /// Worker reported success through its status artifact.
    Succeeded,
    /// Launch, worker, watchdog, or reconciliation failure.
    Failed,
    /// Worker liveness could not be verified after a host restart.
    Unknown,
}

impl OperationState {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true when the operation can no longer transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true for states the retention sweep must never touch.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running)
    }
}

/// List filters for status-inspection commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStateFilter {
    Only(OperationState),
    /// `pending`, `queued`, or `running`.
    Active,
    /// `succeeded` or `failed`.
    Terminal,
}

impl OperationStateFilter {
    /// Parses a filter token used by CLI/tool list commands.
    pub fn parse(raw: &str) -> Option<Self> {
        let filter = match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Only(OperationState::Pending),
            "queued" => Self::Only(OperationState::Queued),
            "running" => Self::Only(OperationState::Running),
            "succeeded" | "success" => Self::Only(OperationState::Succeeded),
            "failed" | "failure" => Self::Only(OperationState::Failed),
            "unknown" => Self::Only(OperationState::Unknown),
            "active" => Self::Active,
            "terminal" => Self::Terminal,
            _ => return None,
        };
        Some(filter)
    }

    pub fn matches(self, state: OperationState) -> bool {
        match self {
            Self::Only(expected) => state == expected,
            Self::Active => state.is_active(),
            Self::Terminal => state.is_terminal(),
        }
    }
}

/// Deferred work types. Only graph construction exists today.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    #[default]
    GraphConstruction,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GraphConstruction => "graph-construction",
        }
    }
}

/// Metrics reported by a successful worker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub entity_count: u64,
    pub relationship_count: u64,
    pub elapsed_ms: u64,
}

/// Structured failure detail surfaced to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub remediation: String,
}

impl ErrorInfo {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            remediation: remediation.into(),
        }
    }
}

/// Durable ledger entry for one background operation.
///
/// `process_id` is only ever set while `state == Running`; every transition
/// out of `Running` clears it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRecord {
    #[serde(default = "operation_record_schema_version")]
    pub schema_version: u32,
    pub operation_id: String,
    #[serde(default)]
    pub kind: OperationKind,
    pub state: OperationState,
    pub reason_code: String,
    /// Reference to content already staged by the caller; never the content itself.
    pub payload_ref: String,
    pub content_digest: String,
    pub workspace_scope: String,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub attempts: u32,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub started_unix_ms: Option<u64>,
    #[serde(default)]
    pub finished_unix_ms: Option<u64>,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub result_summary: Option<ResultSummary>,
    #[serde(default)]
    pub error_info: Option<ErrorInfo>,
}

impl OperationRecord {
    pub(crate) fn pending(operation_id: String, request: &StageRequest, now: u64) -> Self {
        Self {
            schema_version: OPERATION_RECORD_SCHEMA_VERSION,
            operation_id,
            kind: request.kind,
            state: OperationState::Pending,
            reason_code: REASON_PENDING.to_string(),
            payload_ref: request.payload_ref.trim().to_string(),
            content_digest: request
                .content_digest
                .clone()
                .filter(|digest| !digest.trim().is_empty())
                .unwrap_or_else(|| content_digest(request.payload_ref.trim().as_bytes())),
            workspace_scope: request.workspace_scope.trim().to_string(),
            process_id: None,
            attempts: 0,
            created_unix_ms: now,
            updated_unix_ms: now,
            started_unix_ms: None,
            finished_unix_ms: None,
            log_path: None,
            result_summary: None,
            error_info: None,
        }
    }

    /// A dead operation can be relaunched only while its staged content reference survives.
    pub fn is_resumable(&self) -> bool {
        !self.payload_ref.trim().is_empty()
    }

    /// Wall-clock run time, preferring the worker-reported figure.
    pub fn elapsed_ms(&self) -> Option<u64> {
        if let Some(summary) = self.result_summary {
            return Some(summary.elapsed_ms);
        }
        match (self.started_unix_ms, self.finished_unix_ms) {
            (Some(started), Some(finished)) => Some(finished.saturating_sub(started)),
            _ => None,
        }
    }

    pub(crate) fn mark_queued(&mut self, reason_code: &str, now: u64) {
        self.state = OperationState::Queued;
        self.reason_code = reason_code.to_string();
        self.process_id = None;
        self.started_unix_ms = None;
        self.finished_unix_ms = None;
        self.updated_unix_ms = now;
    }

    pub(crate) fn mark_running(&mut self, process_id: u32, log_path: PathBuf, now: u64) {
        self.state = OperationState::Running;
        self.reason_code = REASON_STARTED.to_string();
        self.process_id = Some(process_id);
        self.attempts = self.attempts.saturating_add(1);
        self.started_unix_ms = Some(now);
        self.finished_unix_ms = None;
        self.log_path = Some(log_path);
        self.result_summary = None;
        self.error_info = None;
        self.updated_unix_ms = now;
    }

    pub(crate) fn mark_unknown(&mut self, now: u64) {
        self.state = OperationState::Unknown;
        self.reason_code = REASON_RECONCILED_UNKNOWN.to_string();
        self.process_id = None;
        self.updated_unix_ms = now;
    }

    pub(crate) fn mark_succeeded(&mut self, summary: Option<ResultSummary>, finished: u64, now: u64) {
        self.state = OperationState::Succeeded;
        self.reason_code = REASON_SUCCEEDED.to_string();
        self.process_id = None;
        self.finished_unix_ms = Some(finished);
        self.result_summary = summary;
        self.error_info = None;
        self.updated_unix_ms = now;
    }

    pub(crate) fn mark_failed(&mut self, reason_code: &str, error_info: ErrorInfo, now: u64) {
        self.state = OperationState::Failed;
        self.reason_code = reason_code.to_string();
        self.process_id = None;
        self.finished_unix_ms = Some(now);
        self.result_summary = None;
        self.error_info = Some(error_info);
        self.updated_unix_ms = now;
    }
}

/// Input to `BackgroundOperationManager::stage`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageRequest {
    pub payload_ref: String,
    pub workspace_scope: String,
    pub kind: OperationKind,
    /// Optional caller-computed digest of the staged content.
    pub content_digest: Option<String>,
}

impl StageRequest {
    pub fn new(payload_ref: impl Into<String>, workspace_scope: impl Into<String>) -> Self {
        Self {
            payload_ref: payload_ref.into(),
            workspace_scope: workspace_scope.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_content_digest(mut self, digest: impl Into<String>) -> Self {
        self.content_digest = Some(digest.into());
        self
    }
}

/// Acknowledgment returned to callers by `stage`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationHandle {
    pub operation_id: String,
    pub state: OperationState,
}

/// Short, non-reversible digest used in notification text and audit lines.
pub fn content_digest(content: &[u8]) -> String {
    let hex = format!("{:x}", Sha256::digest(content));
    format!("sha256:{}", &hex[..CONTENT_DIGEST_HEX_LEN])
}

pub(crate) fn next_operation_id() -> String {
    let now = current_unix_timestamp_ms();
    let suffix = OPERATION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{OPERATION_ID_PREFIX}-{now}-{suffix:04}")
}
