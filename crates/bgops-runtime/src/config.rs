use std::path::PathBuf;

const DEFAULT_STATE_DIR: &str = ".bgops";
const DEFAULT_WORKER_PROGRAM: &str = "bgops-graph-worker";
const LEDGER_FILE: &str = "background_ops.json";
const STATUS_DIR: &str = "status";
const LOGS_DIR: &str = "logs";
const EVENTS_FILE: &str = "events.jsonl";

const MINUTE_MS: u64 = 60 * 1_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Host-supplied settings for one `BackgroundOperationManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Workspace-scoped state root holding ledger, status artifacts, logs and audit events.
    pub state_dir: PathBuf,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    /// Concurrency limit (N).
    pub max_running: usize,
    /// Queue capacity (M).
    pub max_queued: usize,
    pub poll_interval_ms: u64,
    /// Watchdog: a running operation without an artifact after this long fails.
    pub artifact_timeout_ms: u64,
    pub malformed_artifact_grace_ms: u64,
    /// How long a dead worker may stay silent before its operation fails.
    pub exit_grace_ms: u64,
    pub success_retention_ms: u64,
    pub failure_retention_ms: u64,
    pub sweep_interval_ms: u64,
    pub notification_window_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            worker_program: DEFAULT_WORKER_PROGRAM.to_string(),
            worker_args: Vec::new(),
            max_running: 2,
            max_queued: 3,
            poll_interval_ms: 5_000,
            artifact_timeout_ms: 30 * MINUTE_MS,
            malformed_artifact_grace_ms: 30_000,
            exit_grace_ms: 15_000,
            success_retention_ms: DAY_MS,
            failure_retention_ms: 7 * DAY_MS,
            sweep_interval_ms: HOUR_MS,
            notification_window_ms: 5 * MINUTE_MS,
        }
    }
}

impl ManagerConfig {
    /// Config rooted at `<workspace>/.bgops`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: workspace_root.into().join(DEFAULT_STATE_DIR),
            ..Self::default()
        }
    }

    pub fn with_worker(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.worker_program = program.into();
        self.worker_args = args;
        self
    }

    pub fn with_limits(mut self, max_running: usize, max_queued: usize) -> Self {
        self.max_running = max_running;
        self.max_queued = max_queued;
        self
    }

    /// Clamps values that would make the manager unusable.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_running = self.max_running.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(10);
        self.artifact_timeout_ms = self.artifact_timeout_ms.max(1);
        self.sweep_interval_ms = self.sweep_interval_ms.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.max_running.saturating_add(self.max_queued)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join(LEDGER_FILE)
    }

    pub fn status_dir(&self) -> PathBuf {
        self.state_dir.join(STATUS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join(LOGS_DIR)
    }

    pub fn events_path(&self) -> PathBuf {
        self.state_dir.join(EVENTS_FILE)
    }

    pub fn worker_log_path(&self, operation_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{operation_id}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::ManagerConfig;
    use std::path::Path;

    #[test]
    fn unit_defaults_match_documented_policy() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_running, 2);
        assert_eq!(config.max_queued, 3);
        assert_eq!(config.capacity(), 5);
        assert_eq!(config.success_retention_ms, 24 * 60 * 60 * 1_000);
        assert_eq!(config.failure_retention_ms, 7 * 24 * 60 * 60 * 1_000);
        assert_eq!(config.notification_window_ms, 5 * 60 * 1_000);
    }

    #[test]
    fn unit_workspace_layout_paths_nest_under_state_dir() {
        let config = ManagerConfig::for_workspace("/work/repo");
        assert_eq!(
            config.ledger_path(),
            Path::new("/work/repo/.bgops/background_ops.json")
        );
        assert_eq!(
            config.worker_log_path("op-1"),
            Path::new("/work/repo/.bgops/logs/op-1.log")
        );
        assert_eq!(config.status_dir(), Path::new("/work/repo/.bgops/status"));
    }

    #[test]
    fn unit_normalized_clamps_zero_concurrency() {
        let config = ManagerConfig::default().with_limits(0, 0).normalized();
        assert_eq!(config.max_running, 1);
        assert_eq!(config.max_queued, 0);
    }
}
