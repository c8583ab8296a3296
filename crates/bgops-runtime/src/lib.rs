//! Background operation orchestration for deferred knowledge-graph construction.
//!
//! Callers stage already-ingested content and receive an operation handle
//! immediately. The [`BackgroundOperationManager`] enforces admission control,
//! launches detached workers, persists lifecycle state in a durable ledger,
//! polls per-operation status artifacts, and emits throttled notifications.

pub mod audit_log;
pub mod config;
pub mod error;
pub mod launcher;
pub mod ledger;
pub mod manager;
pub mod notification;
pub mod operation;
pub mod status_artifact;

pub use audit_log::{AuditEvent, AuditLog};
pub use config::ManagerConfig;
pub use error::{ArtifactError, LaunchError, StageError, CAPACITY_EXCEEDED_CODE};
pub use launcher::{process_is_alive, DetachedProcessLauncher, ProcessLauncher, WorkerInvocation};
pub use ledger::{LedgerMirror, LedgerStore, MemoryMirror};
pub use manager::{
    BackgroundOperationManager, CapacitySnapshot, PollReport, ReconcileReport, SweepReport,
};
pub use notification::{
    Notification, NotificationAction, NotificationSink, NotificationThrottle, OutcomeType,
    TracingSink,
};
pub use operation::{
    content_digest, ErrorInfo, OperationHandle, OperationKind, OperationRecord, OperationState,
    OperationStateFilter, ResultSummary, StageRequest,
};
pub use status_artifact::{
    consume_status_artifact, probe_status_artifact, read_status_artifact, status_artifact_path,
    write_status_artifact, ArtifactProbe, ArtifactStatus, StatusArtifact,
};
