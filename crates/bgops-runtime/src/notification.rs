use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bgops_core::current_unix_timestamp_ms;
use serde::Serialize;

use crate::audit_log::{AuditEvent, AuditLog};
use crate::operation::{OperationRecord, OperationState};

const SUCCESS_ICON: &str = "✔";
const FAILURE_ICON: &str = "✖";

/// Independent throttle tracks; a success never suppresses a failure and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Success,
    Failure,
}

impl OutcomeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    Retry,
    ViewLog,
}

/// Toast-equivalent payload handed to the host's notification surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub operation_id: String,
    pub outcome: OutcomeType,
    pub icon: &'static str,
    pub workspace_scope: String,
    pub content_digest: String,
    pub message: String,
    pub elapsed_ms: Option<u64>,
    pub remediation: Option<String>,
    pub actions: Vec<NotificationAction>,
    pub log_path: Option<PathBuf>,
}

impl Notification {
    /// Builds the outcome notification for a terminal record, `None` otherwise.
    pub fn for_record(record: &OperationRecord) -> Option<Self> {
        match record.state {
            OperationState::Succeeded => {
                let elapsed_ms = record.elapsed_ms();
                let metrics = record
                    .result_summary
                    .map(|summary| {
                        format!(
                            "{} entities, {} relationships",
                            summary.entity_count, summary.relationship_count
                        )
                    })
                    .unwrap_or_else(|| "no metrics reported".to_string());
                let elapsed = elapsed_ms
                    .map(|ms| format!(" in {:.1}s", ms as f64 / 1_000.0))
                    .unwrap_or_default();
                Some(Self {
                    operation_id: record.operation_id.clone(),
                    outcome: OutcomeType::Success,
                    icon: SUCCESS_ICON,
                    workspace_scope: record.workspace_scope.clone(),
                    content_digest: record.content_digest.clone(),
                    message: format!(
                        "Knowledge graph updated for {} ({}): {metrics}{elapsed}",
                        record.workspace_scope, record.content_digest
                    ),
                    elapsed_ms,
                    remediation: None,
                    actions: Vec::new(),
                    log_path: record.log_path.clone(),
                })
            }
            OperationState::Failed => {
                let (detail, remediation) = record
                    .error_info
                    .as_ref()
                    .map(|info| (info.message.clone(), info.remediation.clone()))
                    .unwrap_or_else(|| ("operation did not complete".to_string(), String::new()));
                let mut actions = vec![NotificationAction::Retry];
                if record.log_path.is_some() {
                    actions.push(NotificationAction::ViewLog);
                }
                Some(Self {
                    operation_id: record.operation_id.clone(),
                    outcome: OutcomeType::Failure,
                    icon: FAILURE_ICON,
                    workspace_scope: record.workspace_scope.clone(),
                    content_digest: record.content_digest.clone(),
                    message: format!(
                        "Knowledge graph construction failed for {} ({}): {detail}",
                        record.workspace_scope, record.content_digest
                    ),
                    elapsed_ms: None,
                    remediation: Some(remediation).filter(|hint| !hint.trim().is_empty()),
                    actions,
                    log_path: record.log_path.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Host-provided user-facing notification surface.
pub trait NotificationSink: Send + Sync + Debug {
    fn show(&self, notification: &Notification);
}

/// Default sink that writes toasts to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn show(&self, notification: &Notification) {
        match notification.outcome {
            OutcomeType::Success => tracing::info!(
                operation_id = %notification.operation_id,
                scope = %notification.workspace_scope,
                "{} {}",
                notification.icon,
                notification.message
            ),
            OutcomeType::Failure => tracing::warn!(
                operation_id = %notification.operation_id,
                scope = %notification.workspace_scope,
                remediation = notification.remediation.as_deref().unwrap_or(""),
                "{} {}",
                notification.icon,
                notification.message
            ),
        }
    }
}

/// Per `(workspace scope, outcome)` notification throttle with audit logging.
///
/// `last_notified` lives in memory only; a host restart opens a fresh window.
#[derive(Debug)]
pub struct NotificationThrottle {
    window_ms: u64,
    last_notified: Mutex<HashMap<(String, OutcomeType), u64>>,
    sink: Arc<dyn NotificationSink>,
    audit: Option<AuditLog>,
}

impl NotificationThrottle {
    pub fn new(window_ms: u64, sink: Arc<dyn NotificationSink>, audit: Option<AuditLog>) -> Self {
        Self {
            window_ms,
            last_notified: Mutex::new(HashMap::new()),
            sink,
            audit,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn last_notified_unix_ms(&self, scope: &str, outcome: OutcomeType) -> Option<u64> {
        lock_unpoisoned(&self.last_notified)
            .get(&(scope.to_string(), outcome))
            .copied()
    }

    /// Records and returns whether a notification for `(scope, outcome)` may show at `now_ms`.
    ///
    /// Suppressed attempts do not extend the window.
    pub fn admit(&self, scope: &str, outcome: OutcomeType, now_ms: u64) -> bool {
        let mut last_notified = lock_unpoisoned(&self.last_notified);
        let key = (scope.to_string(), outcome);
        let allowed = match last_notified.get(&key) {
            Some(last) => now_ms.saturating_sub(*last) >= self.window_ms,
            None => true,
        };
        if allowed {
            last_notified.insert(key, now_ms);
        }
        allowed
    }

    pub fn maybe_notify(&self, notification: &Notification) -> bool {
        self.maybe_notify_at(notification, current_unix_timestamp_ms())
    }

    /// Shows `notification` unless throttled; always writes the audit trail.
    pub fn maybe_notify_at(&self, notification: &Notification, now_ms: u64) -> bool {
        let emitted = self.admit(
            notification.workspace_scope.as_str(),
            notification.outcome,
            now_ms,
        );
        if emitted {
            self.sink.show(notification);
        } else {
            tracing::debug!(
                operation_id = %notification.operation_id,
                scope = %notification.workspace_scope,
                outcome = notification.outcome.as_str(),
                "notification suppressed by throttle window"
            );
        }
        if let Some(audit) = self.audit.as_ref() {
            audit.append(&AuditEvent {
                timestamp_unix_ms: now_ms,
                operation_id: notification.operation_id.clone(),
                event: if emitted {
                    "notification_emitted".to_string()
                } else {
                    "notification_suppressed".to_string()
                },
                state: match notification.outcome {
                    OutcomeType::Success => OperationState::Succeeded.as_str().to_string(),
                    OutcomeType::Failure => OperationState::Failed.as_str().to_string(),
                },
                reason_code: format!("notification_{}", notification.outcome.as_str()),
                workspace_scope: notification.workspace_scope.clone(),
                content_digest: notification.content_digest.clone(),
                detail: notification.message.clone(),
            });
        }
        emitted
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
