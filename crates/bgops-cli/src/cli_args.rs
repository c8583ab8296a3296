use std::path::PathBuf;

use bgops_runtime::{ManagerConfig, OperationKind, OperationStateFilter};
use clap::{Parser, Subcommand, ValueEnum};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_state_filter(value: &str) -> Result<OperationStateFilter, String> {
    OperationStateFilter::parse(value).ok_or_else(|| {
        format!(
            "unknown state filter '{value}' (expected pending, queued, running, succeeded, failed, unknown, active or terminal)"
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOperationKind {
    GraphConstruction,
}

impl From<CliOperationKind> for OperationKind {
    fn from(value: CliOperationKind) -> Self {
        match value {
            CliOperationKind::GraphConstruction => OperationKind::GraphConstruction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliArtifactStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Parser)]
#[command(
    name = "bgops",
    about = "Stage, track and reconcile detached background operations",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub manager: ManagerArgs,

    #[command(subcommand)]
    pub command: CliCommand,
}

/// Manager settings shared by every subcommand.
#[derive(Debug, Clone, clap::Args)]
pub struct ManagerArgs {
    #[arg(
        long = "state-dir",
        env = "BGOPS_STATE_DIR",
        default_value = ".bgops",
        help = "Workspace-scoped directory holding the ledger, status artifacts, worker logs and audit events."
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "worker-program",
        env = "BGOPS_WORKER_PROGRAM",
        default_value = "bgops-graph-worker",
        help = "Executable launched as a detached worker for each operation."
    )]
    pub worker_program: String,

    #[arg(
        long = "worker-arg",
        env = "BGOPS_WORKER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        help = "Fixed arguments passed to the worker before the per-operation flags."
    )]
    pub worker_args: Vec<String>,

    #[arg(
        long = "max-running",
        env = "BGOPS_MAX_RUNNING",
        default_value_t = 2,
        value_parser = parse_positive_usize,
        help = "Maximum concurrently running operations."
    )]
    pub max_running: usize,

    #[arg(
        long = "max-queued",
        env = "BGOPS_MAX_QUEUED",
        default_value_t = 3,
        help = "Maximum operations waiting for a running slot. Zero disables queueing."
    )]
    pub max_queued: usize,

    #[arg(
        long = "poll-interval-ms",
        env = "BGOPS_POLL_INTERVAL_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        help = "Status artifact polling interval used by `watch`."
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "artifact-timeout-ms",
        env = "BGOPS_ARTIFACT_TIMEOUT_MS",
        default_value_t = 30 * 60 * 1_000,
        value_parser = parse_positive_u64,
        help = "Running operations without a status artifact after this long are failed."
    )]
    pub artifact_timeout_ms: u64,

    #[arg(
        long = "malformed-artifact-grace-ms",
        env = "BGOPS_MALFORMED_ARTIFACT_GRACE_MS",
        default_value_t = 30_000,
        help = "How long an unparseable status artifact may stay unparseable before the operation fails."
    )]
    pub malformed_artifact_grace_ms: u64,

    #[arg(
        long = "exit-grace-ms",
        env = "BGOPS_EXIT_GRACE_MS",
        default_value_t = 15_000,
        help = "How long an exited worker may stay silent before its operation fails."
    )]
    pub exit_grace_ms: u64,

    #[arg(
        long = "success-retention-ms",
        env = "BGOPS_SUCCESS_RETENTION_MS",
        default_value_t = 24 * 60 * 60 * 1_000,
        help = "Retention window for succeeded ledger records."
    )]
    pub success_retention_ms: u64,

    #[arg(
        long = "failure-retention-ms",
        env = "BGOPS_FAILURE_RETENTION_MS",
        default_value_t = 7 * 24 * 60 * 60 * 1_000,
        help = "Retention window for failed ledger records."
    )]
    pub failure_retention_ms: u64,

    #[arg(
        long = "sweep-interval-ms",
        env = "BGOPS_SWEEP_INTERVAL_MS",
        default_value_t = 60 * 60 * 1_000,
        value_parser = parse_positive_u64,
        help = "Minimum spacing between automatic retention sweeps."
    )]
    pub sweep_interval_ms: u64,

    #[arg(
        long = "notification-window-ms",
        env = "BGOPS_NOTIFICATION_WINDOW_MS",
        default_value_t = 5 * 60 * 1_000,
        help = "At most one notification per workspace scope and outcome inside this window."
    )]
    pub notification_window_ms: u64,
}

impl ManagerArgs {
    pub fn to_config(&self) -> ManagerConfig {
        ManagerConfig {
            state_dir: self.state_dir.clone(),
            worker_program: self.worker_program.clone(),
            worker_args: self.worker_args.clone(),
            max_running: self.max_running,
            max_queued: self.max_queued,
            poll_interval_ms: self.poll_interval_ms,
            artifact_timeout_ms: self.artifact_timeout_ms,
            malformed_artifact_grace_ms: self.malformed_artifact_grace_ms,
            exit_grace_ms: self.exit_grace_ms,
            success_retention_ms: self.success_retention_ms,
            failure_retention_ms: self.failure_retention_ms,
            sweep_interval_ms: self.sweep_interval_ms,
            notification_window_ms: self.notification_window_ms,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Admit an already-staged payload: run now, queue, or reject with 429_BACKLOG.
    Stage(StageArgs),
    /// Print one operation record.
    Status(StatusArgs),
    /// List operation records, newest first.
    List(ListArgs),
    /// Print running/queued counters and limits.
    Capacity,
    /// Rebuild admission state from the ledger and worker liveness.
    Reconcile,
    /// Remove expired records, their logs, and orphaned status artifacts.
    Sweep,
    /// Run the poller in the foreground until Ctrl-C.
    Watch,
    /// Worker helper: atomically publish a terminal status artifact.
    WriteStatus(WriteStatusArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct StageArgs {
    #[arg(long = "payload-ref", help = "Opaque reference to the staged content.")]
    pub payload_ref: String,

    #[arg(long = "scope", help = "Workspace scope the result belongs to.")]
    pub workspace_scope: String,

    #[arg(long = "kind", value_enum, default_value = "graph-construction")]
    pub kind: CliOperationKind,

    #[arg(
        long = "content-digest",
        help = "Optional digest of the staged content; derived from the payload reference when omitted."
    )]
    pub content_digest: Option<String>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct StatusArgs {
    pub operation_id: String,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ListArgs {
    #[arg(long = "state", value_parser = parse_state_filter)]
    pub state: Option<OperationStateFilter>,
}

#[derive(Debug, Clone, clap::Args)]
pub struct WriteStatusArgs {
    #[arg(long = "status-path")]
    pub status_path: PathBuf,

    #[arg(long = "operation-id")]
    pub operation_id: String,

    #[arg(long = "status", value_enum)]
    pub status: CliArtifactStatus,

    #[arg(long = "entity-count", default_value_t = 0)]
    pub entity_count: u64,

    #[arg(long = "relationship-count", default_value_t = 0)]
    pub relationship_count: u64,

    #[arg(long = "elapsed-ms", default_value_t = 0)]
    pub elapsed_ms: u64,

    #[arg(long = "error-code", default_value = "WORKER_FAILURE")]
    pub error_code: String,

    #[arg(long = "error-message", default_value = "worker reported failure")]
    pub error_message: String,

    #[arg(long = "remediation", default_value = "Open the worker log for details and retry.")]
    pub remediation: String,
}
