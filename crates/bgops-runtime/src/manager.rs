use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bgops_core::current_unix_timestamp_ms;
use serde::Serialize;
use tokio::sync::Notify;

use crate::audit_log::{AuditEvent, AuditLog};
use crate::config::ManagerConfig;
use crate::error::{LaunchError, StageError};
use crate::launcher::{DetachedProcessLauncher, ProcessLauncher, WorkerInvocation};
use crate::ledger::{LedgerMirror, LedgerStore, MemoryMirror};
use crate::notification::{Notification, NotificationSink, NotificationThrottle, TracingSink};
use crate::operation::{
    next_operation_id, ErrorInfo, OperationHandle, OperationRecord, OperationState,
    OperationStateFilter, StageRequest, ERROR_CODE_ARTIFACT_MALFORMED,
    ERROR_CODE_ARTIFACT_TIMEOUT, ERROR_CODE_LAUNCH_FAILED, ERROR_CODE_RECONCILIATION_UNKNOWN,
    ERROR_CODE_WORKER_EXITED, ERROR_CODE_WORKER_FAILURE, REASON_ARTIFACT_MALFORMED,
    REASON_ARTIFACT_TIMEOUT, REASON_LAUNCH_FAILED, REASON_NOT_RESUMABLE, REASON_QUEUED,
    REASON_REQUEUED_AFTER_RESTART, REASON_RESUMED_ALIVE, REASON_WORKER_EXITED,
    REASON_WORKER_FAILED,
};
use crate::status_artifact::{
    consume_status_artifact, probe_status_artifact, status_artifact_path, ArtifactProbe,
    ArtifactStatus, StatusArtifact,
};

/// Admission counters as seen by status commands.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub running: usize,
    pub queued: usize,
    pub max_running: usize,
    pub max_queued: usize,
}

/// Counts from one poller tick.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PollReport {
    pub succeeded: usize,
    pub failed: usize,
    pub dispatched: usize,
    pub swept: usize,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resumed_alive: usize,
    pub completed_from_artifact: usize,
    pub requeued: usize,
    pub failed: usize,
    pub dispatched: usize,
}

/// Counts from one retention sweep.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_records: usize,
    pub removed_artifacts: usize,
    pub removed_logs: usize,
}

#[derive(Debug)]
struct ManagerState {
    ledger: LedgerStore,
    running: BTreeSet<String>,
    queue: VecDeque<String>,
    malformed_since: HashMap<String, u64>,
    dead_since: HashMap<String, u64>,
    last_sweep_unix_ms: u64,
    reconciled: bool,
}

#[derive(Debug)]
struct ManagerInner {
    config: ManagerConfig,
    launcher: Arc<dyn ProcessLauncher>,
    notifications: NotificationThrottle,
    audit: AuditLog,
    state: Mutex<ManagerState>,
    poller_running: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_signal: Notify,
}

/// Process-wide orchestrator for deferred background operations.
///
/// Construct once at host startup and share clones with every caller. All
/// counter and ledger mutations happen under one lock, so admission,
/// dequeue-on-completion, and reconciliation never interleave. Notifications
/// are emitted after the lock is released.
#[derive(Debug, Clone)]
pub struct BackgroundOperationManager {
    inner: Arc<ManagerInner>,
}

type Outbox = Vec<Notification>;

impl BackgroundOperationManager {
    /// Builds a manager with the detached launcher, tracing sink and in-memory mirror.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let launcher = Arc::new(DetachedProcessLauncher::new(
            config.worker_program.clone(),
            config.worker_args.clone(),
        ));
        Self::with_parts(
            config,
            launcher,
            Arc::new(TracingSink),
            Arc::new(MemoryMirror::default()),
        )
    }

    pub fn with_parts(
        config: ManagerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        sink: Arc<dyn NotificationSink>,
        mirror: Arc<dyn LedgerMirror>,
    ) -> Result<Self> {
        let config = config.normalized();
        for dir in [config.state_dir.clone(), config.status_dir(), config.logs_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let ledger = LedgerStore::open(config.ledger_path(), mirror)?;
        let audit = AuditLog::new(config.events_path());
        let notifications =
            NotificationThrottle::new(config.notification_window_ms, sink, Some(audit.clone()));
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                launcher,
                notifications,
                audit,
                state: Mutex::new(ManagerState {
                    ledger,
                    running: BTreeSet::new(),
                    queue: VecDeque::new(),
                    malformed_since: HashMap::new(),
                    dead_since: HashMap::new(),
                    last_sweep_unix_ms: 0,
                    reconciled: false,
                }),
                poller_running: AtomicBool::new(false),
                shutdown_requested: AtomicBool::new(false),
                shutdown_signal: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.inner.audit
    }

    pub fn status_artifact_path(&self, operation_id: &str) -> PathBuf {
        status_artifact_path(&self.inner.config.status_dir(), operation_id)
    }

    /// Admits an already-staged payload: runs it now, queues it, or rejects it.
    ///
    /// Returns after at most a few ledger writes and one non-blocking spawn.
    #[tracing::instrument(
        name = "bgops.manager.stage",
        skip(self, request),
        fields(scope = %request.workspace_scope, kind = request.kind.as_str())
    )]
    pub fn stage(&self, request: StageRequest) -> Result<OperationHandle, StageError> {
        if request.payload_ref.trim().is_empty() {
            return Err(StageError::InvalidRequest(
                "payload reference must be non-empty".to_string(),
            ));
        }
        if request.workspace_scope.trim().is_empty() {
            return Err(StageError::InvalidRequest(
                "workspace scope must be non-empty".to_string(),
            ));
        }

        let mut outbox = Outbox::new();
        let result = {
            let mut state = self.lock_state();
            let now = current_unix_timestamp_ms();
            if !state.reconciled {
                self.reconcile_locked(&mut state, now, &mut outbox);
            }
            self.stage_locked(&mut state, &request, now, &mut outbox)
        };
        self.emit(outbox);
        result
    }

    fn stage_locked(
        &self,
        state: &mut ManagerState,
        request: &StageRequest,
        now: u64,
        outbox: &mut Outbox,
    ) -> Result<OperationHandle, StageError> {
        let config = &self.inner.config;
        let running = state.running.len();
        let queued = state.queue.len();
        let run_now = running < config.max_running && state.queue.is_empty();
        if !run_now && queued >= config.max_queued {
            tracing::warn!(
                running,
                queued,
                capacity = config.capacity(),
                "stage rejected: background backlog full"
            );
            return Err(StageError::CapacityExceeded {
                running,
                queued,
                capacity: config.capacity(),
            });
        }

        let mut operation_id = next_operation_id();
        while state.ledger.contains(&operation_id) {
            operation_id = next_operation_id();
        }
        let mut record = OperationRecord::pending(operation_id.clone(), request, now);
        state.ledger.put(record.clone());
        self.audit(&record, "created", "operation staged");

        if run_now {
            return match self.launch_locked(state, record, now, outbox) {
                Ok(record) => Ok(OperationHandle {
                    operation_id: record.operation_id,
                    state: record.state,
                }),
                Err(source) => Err(StageError::Launch {
                    operation_id,
                    source,
                }),
            };
        }

        record.mark_queued(REASON_QUEUED, now);
        state.ledger.put(record.clone());
        state.queue.push_back(operation_id.clone());
        self.audit(
            &record,
            "queued",
            format!("queue_depth={}", state.queue.len()),
        );
        tracing::info!(
            operation_id = %operation_id,
            queue_depth = state.queue.len(),
            "operation queued"
        );
        self.dispatch_ready(state, now, outbox);
        let state_now = state
            .ledger
            .get(&operation_id)
            .map(|record| record.state)
            .unwrap_or(OperationState::Queued);
        Ok(OperationHandle {
            operation_id,
            state: state_now,
        })
    }

    /// Spawns the worker for `record` and records `running`, or `failed` on launch error.
    fn launch_locked(
        &self,
        state: &mut ManagerState,
        mut record: OperationRecord,
        now: u64,
        outbox: &mut Outbox,
    ) -> Result<OperationRecord, LaunchError> {
        let config = &self.inner.config;
        let status_path = status_artifact_path(&config.status_dir(), &record.operation_id);
        if let Err(error) = consume_status_artifact(&status_path) {
            tracing::warn!(
                operation_id = %record.operation_id,
                error = %format!("{error:#}"),
                "failed to clear stale status artifact before launch"
            );
        }
        let invocation = WorkerInvocation {
            operation_id: record.operation_id.clone(),
            kind: record.kind,
            payload_ref: record.payload_ref.clone(),
            status_path,
            log_path: config.worker_log_path(&record.operation_id),
        };

        match self.inner.launcher.spawn(&invocation) {
            Ok(process_id) => {
                record.mark_running(process_id, invocation.log_path, now);
                state.running.insert(record.operation_id.clone());
                state.ledger.put(record.clone());
                self.audit(&record, "started", format!("process_id={process_id}"));
                tracing::info!(
                    operation_id = %record.operation_id,
                    process_id,
                    attempt = record.attempts,
                    "operation started"
                );
                Ok(record)
            }
            Err(error) => {
                record.mark_failed(
                    REASON_LAUNCH_FAILED,
                    ErrorInfo::new(
                        ERROR_CODE_LAUNCH_FAILED,
                        error.to_string(),
                        format!(
                            "Check that the worker executable '{}' is installed and runnable.",
                            error.program
                        ),
                    ),
                    now,
                );
                state.running.remove(&record.operation_id);
                state.ledger.put(record.clone());
                self.audit(&record, "failed", error.to_string());
                tracing::warn!(
                    operation_id = %record.operation_id,
                    error = %error,
                    "operation failed to launch"
                );
                outbox.extend(Notification::for_record(&record));
                Err(error)
            }
        }
    }

    /// Moves queue heads into free running slots, strictly FIFO.
    fn dispatch_ready(&self, state: &mut ManagerState, now: u64, outbox: &mut Outbox) -> usize {
        let mut dispatched = 0;
        while state.running.len() < self.inner.config.max_running {
            let Some(operation_id) = state.queue.pop_front() else {
                break;
            };
            let Some(record) = state.ledger.get(&operation_id).cloned() else {
                continue;
            };
            if record.state != OperationState::Queued {
                continue;
            }
            if self.launch_locked(state, record, now, outbox).is_ok() {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Moves a running operation to its terminal state and frees its slot.
    fn finish_locked(
        &self,
        state: &mut ManagerState,
        mut record: OperationRecord,
        outcome: Completion,
        now: u64,
        outbox: &mut Outbox,
    ) {
        match outcome {
            Completion::Artifact(artifact) => match artifact.status {
                ArtifactStatus::Succeeded => {
                    let finished = clamp_finished(&record, artifact.finished_unix_ms(), now);
                    record.mark_succeeded(artifact.result_summary, finished, now);
                }
                ArtifactStatus::Failed => {
                    let error_info = artifact.error_info.clone().unwrap_or_else(|| {
                        ErrorInfo::new(
                            ERROR_CODE_WORKER_FAILURE,
                            "worker reported failure without details",
                            "Open the worker log for details and retry.",
                        )
                    });
                    let finished = clamp_finished(&record, artifact.finished_unix_ms(), now);
                    record.mark_failed(REASON_WORKER_FAILED, error_info, now);
                    record.finished_unix_ms = Some(finished);
                }
            },
            Completion::Failure {
                reason_code,
                error_info,
            } => record.mark_failed(reason_code, error_info, now),
        }

        state.running.remove(&record.operation_id);
        state.malformed_since.remove(&record.operation_id);
        state.dead_since.remove(&record.operation_id);
        state.ledger.put(record.clone());
        self.audit(
            &record,
            record.state.as_str(),
            record
                .error_info
                .as_ref()
                .map(|info| format!("{}: {}", info.code, info.message))
                .unwrap_or_else(|| "operation completed".to_string()),
        );
        tracing::info!(
            operation_id = %record.operation_id,
            state = record.state.as_str(),
            reason_code = %record.reason_code,
            "operation finished"
        );
        outbox.extend(Notification::for_record(&record));
    }

    pub fn get_status(&self, operation_id: &str) -> Option<OperationRecord> {
        self.lock_state().ledger.get(operation_id).cloned()
    }

    pub fn list(&self, filter: Option<OperationStateFilter>) -> Vec<OperationRecord> {
        self.lock_state().ledger.list(filter)
    }

    pub fn capacity(&self) -> CapacitySnapshot {
        let state = self.lock_state();
        CapacitySnapshot {
            running: state.running.len(),
            queued: state.queue.len(),
            max_running: self.inner.config.max_running,
            max_queued: self.inner.config.max_queued,
        }
    }

    /// Queued operation ids in dispatch order.
    pub fn queued_ids(&self) -> Vec<String> {
        self.lock_state().queue.iter().cloned().collect()
    }

    /// One poller tick: consume artifacts, run watchdogs, dispatch queue, sweep if due.
    ///
    /// Work is proportional to the number of running operations.
    pub fn poll_once(&self) -> PollReport {
        let mut outbox = Outbox::new();
        let report = {
            let mut state = self.lock_state();
            let now = current_unix_timestamp_ms();
            if !state.reconciled {
                self.reconcile_locked(&mut state, now, &mut outbox);
            }
            self.poll_locked(&mut state, now, &mut outbox)
        };
        self.emit(outbox);
        report
    }

    fn poll_locked(&self, state: &mut ManagerState, now: u64, outbox: &mut Outbox) -> PollReport {
        let config = &self.inner.config;
        let mut report = PollReport::default();
        let running_ids = state.running.iter().cloned().collect::<Vec<_>>();
        for operation_id in running_ids {
            let Some(record) = state.ledger.get(&operation_id).cloned() else {
                state.running.remove(&operation_id);
                continue;
            };
            if record.state != OperationState::Running {
                state.running.remove(&operation_id);
                continue;
            }

            let path = status_artifact_path(&config.status_dir(), &operation_id);
            let completion = match probe_status_artifact(&path, &operation_id) {
                ArtifactProbe::Ready(artifact) => Some(Completion::Artifact(artifact)),
                ArtifactProbe::Malformed(detail) => {
                    let first_seen = *state
                        .malformed_since
                        .entry(operation_id.clone())
                        .or_insert(now);
                    if now.saturating_sub(first_seen) >= config.malformed_artifact_grace_ms {
                        Some(malformed_failure(detail))
                    } else {
                        tracing::debug!(
                            operation_id = %operation_id,
                            detail = %detail,
                            "status artifact not parseable yet"
                        );
                        None
                    }
                }
                ArtifactProbe::Absent => {
                    state.malformed_since.remove(&operation_id);
                    self.watchdog_check(state, &record, now)
                }
            };

            let Some(completion) = completion else {
                continue;
            };
            self.finish_locked(state, record, completion, now, outbox);
            // The record is terminal now; a late artifact is dropped with it.
            if let Err(error) = consume_status_artifact(&path) {
                tracing::warn!(
                    operation_id = %operation_id,
                    error = %format!("{error:#}"),
                    "failed to delete consumed status artifact; sweep will retry"
                );
            }
            match state.ledger.get(&operation_id).map(|record| record.state) {
                Some(OperationState::Succeeded) => report.succeeded += 1,
                _ => report.failed += 1,
            }
        }

        report.dispatched = self.dispatch_ready(state, now, outbox);
        if now.saturating_sub(state.last_sweep_unix_ms) >= config.sweep_interval_ms {
            report.swept = self.sweep_locked(state, now).removed_records;
        }
        if state.ledger.is_dirty() {
            if let Err(error) = state.ledger.flush() {
                tracing::warn!(error = %format!("{error:#}"), "ledger flush retry failed");
            }
        }
        report
    }

    /// Timeout watchdog plus dead-worker detection for a running record without artifact.
    fn watchdog_check(
        &self,
        state: &mut ManagerState,
        record: &OperationRecord,
        now: u64,
    ) -> Option<Completion> {
        let config = &self.inner.config;
        let started = record.started_unix_ms.unwrap_or(record.updated_unix_ms);
        if now.saturating_sub(started) >= config.artifact_timeout_ms {
            return Some(Completion::Failure {
                reason_code: REASON_ARTIFACT_TIMEOUT,
                error_info: ErrorInfo::new(
                    ERROR_CODE_ARTIFACT_TIMEOUT,
                    format!(
                        "operation did not complete within {}",
                        describe_duration_ms(config.artifact_timeout_ms)
                    ),
                    "Open the worker log, then retry the capture.",
                ),
            });
        }

        let alive = record
            .process_id
            .map(|process_id| self.inner.launcher.is_alive(process_id))
            .unwrap_or(false);
        if alive {
            state.dead_since.remove(&record.operation_id);
            return None;
        }
        let first_dead = *state
            .dead_since
            .entry(record.operation_id.clone())
            .or_insert(now);
        if now.saturating_sub(first_dead) < config.exit_grace_ms {
            return None;
        }
        Some(Completion::Failure {
            reason_code: REASON_WORKER_EXITED,
            error_info: ErrorInfo::new(
                ERROR_CODE_WORKER_EXITED,
                "worker process exited without reporting a status",
                "Open the worker log for the crash output, then retry.",
            ),
        })
    }

    /// Rebuilds admission state from the ledger plus liveness probes.
    ///
    /// Safe to call repeatedly: live workers are left alone, queued work is
    /// never duplicated, and only operations without a live worker are relaunched.
    #[tracing::instrument(name = "bgops.manager.reconcile", skip(self))]
    pub fn reconcile_on_startup(&self) -> ReconcileReport {
        let mut outbox = Outbox::new();
        let report = {
            let mut state = self.lock_state();
            let now = current_unix_timestamp_ms();
            self.reconcile_locked(&mut state, now, &mut outbox)
        };
        self.emit(outbox);
        report
    }

    fn reconcile_locked(
        &self,
        state: &mut ManagerState,
        now: u64,
        outbox: &mut Outbox,
    ) -> ReconcileReport {
        let config = &self.inner.config;
        let mut report = ReconcileReport::default();
        let records = state.ledger.records_by_creation();

        let mut running = BTreeSet::new();
        let mut dead = Vec::new();
        let mut waiting = Vec::new();
        for mut record in records {
            match record.state {
                OperationState::Running => {
                    let alive = record
                        .process_id
                        .map(|process_id| self.inner.launcher.is_alive(process_id))
                        .unwrap_or(false);
                    if alive {
                        running.insert(record.operation_id.clone());
                        if !state.running.contains(&record.operation_id) {
                            report.resumed_alive += 1;
                            record.reason_code = REASON_RESUMED_ALIVE.to_string();
                            record.updated_unix_ms = now;
                            state.ledger.put(record.clone());
                            self.audit(
                                &record,
                                "resumed",
                                format!(
                                    "process_id={}",
                                    record.process_id.unwrap_or_default()
                                ),
                            );
                        }
                    } else {
                        dead.push(record);
                    }
                }
                OperationState::Unknown => dead.push(record),
                OperationState::Pending | OperationState::Queued => waiting.push(record),
                OperationState::Succeeded | OperationState::Failed => {}
            }
        }
        state.running = running;

        // Admission order: the in-session queue, then lost workers, then recovered
        // waiting records. Anything past `max_running + max_queued` fails.
        let previous_queue = std::mem::take(&mut state.queue);
        let (mut preserved, recovered): (Vec<_>, Vec<_>) = waiting
            .into_iter()
            .partition(|record| previous_queue.contains(&record.operation_id));
        preserved.sort_by_key(|record| {
            previous_queue
                .iter()
                .position(|operation_id| operation_id == &record.operation_id)
        });

        for record in preserved {
            self.readmit_waiting_locked(state, record, now, outbox, &mut report);
        }

        for mut record in dead {
            if record.state != OperationState::Unknown {
                record.mark_unknown(now);
                state.ledger.put(record.clone());
                self.audit(&record, "unknown", "worker liveness could not be verified");
                tracing::warn!(
                    operation_id = %record.operation_id,
                    "worker not alive after restart; reconciling"
                );
            }

            let path = status_artifact_path(&config.status_dir(), &record.operation_id);
            let completion = match probe_status_artifact(&path, &record.operation_id) {
                ArtifactProbe::Ready(artifact) => Some(Completion::Artifact(artifact)),
                ArtifactProbe::Malformed(detail) => Some(malformed_failure(detail)),
                ArtifactProbe::Absent => None,
            };
            if let Some(completion) = completion {
                self.finish_locked(state, record, completion, now, outbox);
                if let Err(error) = consume_status_artifact(&path) {
                    tracing::warn!(
                        error = %format!("{error:#}"),
                        path = %path.display(),
                        "failed to delete consumed status artifact"
                    );
                }
                report.completed_from_artifact += 1;
                continue;
            }

            if record.is_resumable() && self.has_backlog_room(state) {
                record.mark_queued(REASON_REQUEUED_AFTER_RESTART, now);
                state.ledger.put(record.clone());
                self.audit(&record, "queued", "requeued for a fresh attempt after restart");
                state.queue.push_back(record.operation_id.clone());
                report.requeued += 1;
            } else {
                let message = if record.is_resumable() {
                    "worker was lost across a restart and the backlog is full"
                } else {
                    "worker was lost across a restart and the staged content reference is gone"
                };
                self.fail_unresumable_locked(state, record, message, now, outbox);
                report.failed += 1;
            }
        }

        for record in recovered {
            self.readmit_waiting_locked(state, record, now, outbox, &mut report);
        }

        report.dispatched = self.dispatch_ready(state, now, outbox);
        state.reconciled = true;
        if now.saturating_sub(state.last_sweep_unix_ms) >= config.sweep_interval_ms {
            self.sweep_locked(state, now);
        }
        tracing::info!(
            resumed_alive = report.resumed_alive,
            completed_from_artifact = report.completed_from_artifact,
            requeued = report.requeued,
            failed = report.failed,
            dispatched = report.dispatched,
            running = state.running.len(),
            queued = state.queue.len(),
            "ledger reconciled"
        );
        report
    }

    fn has_backlog_room(&self, state: &ManagerState) -> bool {
        state.running.len() + state.queue.len() < self.inner.config.capacity()
    }

    /// Puts a pending or queued record back in line, or fails it when limits no longer fit it.
    fn readmit_waiting_locked(
        &self,
        state: &mut ManagerState,
        mut record: OperationRecord,
        now: u64,
        outbox: &mut Outbox,
        report: &mut ReconcileReport,
    ) {
        if !self.has_backlog_room(state) {
            self.fail_unresumable_locked(
                state,
                record,
                "backlog limits were lowered across a restart and no slot remains",
                now,
                outbox,
            );
            report.failed += 1;
            return;
        }
        if record.state == OperationState::Pending {
            record.mark_queued(REASON_REQUEUED_AFTER_RESTART, now);
            state.ledger.put(record.clone());
            self.audit(&record, "queued", "pending operation recovered after restart");
        }
        state.queue.push_back(record.operation_id);
    }

    fn fail_unresumable_locked(
        &self,
        state: &mut ManagerState,
        record: OperationRecord,
        message: &str,
        now: u64,
        outbox: &mut Outbox,
    ) {
        self.finish_locked(
            state,
            record,
            Completion::Failure {
                reason_code: REASON_NOT_RESUMABLE,
                error_info: ErrorInfo::new(
                    ERROR_CODE_RECONCILIATION_UNKNOWN,
                    message,
                    "Stage the content again.",
                ),
            },
            now,
            outbox,
        );
    }

    /// Retention sweep: expired terminal records, their logs, and orphaned artifacts.
    pub fn sweep_retention(&self) -> SweepReport {
        let mut state = self.lock_state();
        let now = current_unix_timestamp_ms();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut ManagerState, now: u64) -> SweepReport {
        let config = &self.inner.config;
        let mut report = SweepReport::default();
        state.last_sweep_unix_ms = now;

        let removed = state.ledger.sweep_expired(
            config.success_retention_ms,
            config.failure_retention_ms,
            now,
        );
        report.removed_records = removed.len();
        for record in &removed {
            if let Some(log_path) = record.log_path.as_ref() {
                if std::fs::remove_file(log_path).is_ok() {
                    report.removed_logs += 1;
                }
            }
        }

        let status_dir = config.status_dir();
        if let Ok(entries) = std::fs::read_dir(&status_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(operation_id) = orphan_candidate_id(&path) else {
                    continue;
                };
                let orphaned = state
                    .ledger
                    .get(&operation_id)
                    .map_or(true, |record| record.state.is_terminal());
                if orphaned && std::fs::remove_file(&path).is_ok() {
                    report.removed_artifacts += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                removed_records = report.removed_records,
                removed_artifacts = report.removed_artifacts,
                removed_logs = report.removed_logs,
                "retention sweep"
            );
        }
        report
    }

    /// Starts the periodic poller once; later calls are no-ops returning false.
    pub fn start_poller(&self) -> bool {
        if self
            .inner
            .poller_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.inner.shutdown_requested.store(false, Ordering::SeqCst);

        let manager = self.clone();
        spawn_background_future(async move {
            manager.poller_loop().await;
        });
        true
    }

    async fn poller_loop(self) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.inner.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            if self.inner.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.poll_once();
                    if report != PollReport::default() {
                        tracing::debug!(
                            succeeded = report.succeeded,
                            failed = report.failed,
                            dispatched = report.dispatched,
                            swept = report.swept,
                            "poller tick"
                        );
                    }
                }
                _ = self.inner.shutdown_signal.notified() => break,
            }
        }
        self.inner.poller_running.store(false, Ordering::SeqCst);
    }

    pub fn is_poller_running(&self) -> bool {
        self.inner.poller_running.load(Ordering::SeqCst)
    }

    /// Stops the poller and flushes the ledger. Workers keep running.
    #[tracing::instrument(name = "bgops.manager.shutdown", skip(self))]
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        self.inner.shutdown_signal.notify_waiters();
        let mut state = self.lock_state();
        state.ledger.flush().context("failed to flush ledger on shutdown")?;
        tracing::info!(
            running = state.running.len(),
            queued = state.queue.len(),
            "background operation manager shut down; detached workers left running"
        );
        Ok(())
    }

    fn audit(&self, record: &OperationRecord, event: &str, detail: impl Into<String>) {
        self.inner
            .audit
            .append(&AuditEvent::for_record(record, event, detail));
    }

    fn emit(&self, outbox: Outbox) {
        for notification in outbox {
            self.inner.notifications.maybe_notify(&notification);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        lock_unpoisoned(&self.inner.state)
    }
}

#[derive(Debug)]
enum Completion {
    Artifact(StatusArtifact),
    Failure {
        reason_code: &'static str,
        error_info: ErrorInfo,
    },
}

/// Worker clocks are untrusted: keep `finishedAt` within `[started, now]`.
fn clamp_finished(record: &OperationRecord, reported: Option<u64>, now: u64) -> u64 {
    let started = record.started_unix_ms.unwrap_or(0).min(now);
    reported.unwrap_or(now).clamp(started, now)
}

/// Renders a millisecond span with the largest whole unit that fits.
fn describe_duration_ms(duration_ms: u64) -> String {
    let (count, unit) = if duration_ms >= 60_000 && duration_ms % 60_000 == 0 {
        (duration_ms / 60_000, "minute")
    } else if duration_ms >= 1_000 && duration_ms % 1_000 == 0 {
        (duration_ms / 1_000, "second")
    } else {
        return format!("{duration_ms} ms");
    };
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

fn malformed_failure(detail: String) -> Completion {
    Completion::Failure {
        reason_code: REASON_ARTIFACT_MALFORMED,
        error_info: ErrorInfo::new(
            ERROR_CODE_ARTIFACT_MALFORMED,
            format!("worker wrote an unreadable status artifact: {detail}"),
            "Open the worker log, then retry.",
        ),
    }
}

/// Operation id owning a status-dir entry: `<id>.json` or its `.<id>.json.tmp-*` temp file.
fn orphan_candidate_id(path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if let Some(temp) = name.strip_prefix('.') {
        let (target, _) = temp.split_once(".json.tmp-")?;
        return Some(target.to_string());
    }
    name.strip_suffix(".json").map(str::to_string)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn spawn_background_future<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
        return;
    }

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(future),
            Err(error) => tracing::error!(error = %error, "background poller bootstrap failed"),
        }
    });
}
