#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use bgops_runtime::{
    BackgroundOperationManager, ManagerConfig, OperationRecord, OperationState, StageError,
    StageRequest, CAPACITY_EXCEEDED_CODE,
};

const SUCCESS_WORKER: &str = r#"
gate="$1"; shift
while [ ! -f "$gate" ]; do sleep 0.02; done
echo "graph worker $2 reading $4"
printf '{"operationId":"%s","status":"succeeded","finishedAt":"2026-01-01T00:00:00Z","resultSummary":{"entityCount":3,"relationshipCount":2,"elapsedMs":10}}' "$2" > "$6.partial"
mv "$6.partial" "$6"
"#;

const FAILING_WORKER: &str = r#"
printf '{"operationId":"%s","status":"failed","finishedAt":"2026-01-01T00:00:00Z","errorInfo":{"code":"PY_IMPORT","message":"No module named graphlib","remediation":"Install graph extras."}}' "$2" > "$6.partial"
mv "$6.partial" "$6"
"#;

const CRASHING_WORKER: &str = r#"
echo "segfault simulation" >&2
exit 3
"#;

fn sh_config(state_root: &Path, script: &str, extra: &[String]) -> ManagerConfig {
    let mut args = vec!["-c".to_string(), script.to_string(), "graph-worker".to_string()];
    args.extend(extra.iter().cloned());
    let mut config = ManagerConfig::for_workspace(state_root).with_worker("sh", args);
    config.exit_grace_ms = 50;
    config
}

fn wait_for_state(
    manager: &BackgroundOperationManager,
    operation_id: &str,
    expected: OperationState,
) -> OperationRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        manager.poll_once();
        let record = manager.get_status(operation_id).expect("record present");
        if record.state == expected {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "operation {operation_id} stuck in {:?}",
            record.state
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn integration_detached_worker_success_is_recorded_and_artifact_consumed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gate = temp.path().join("gate");
    std::fs::write(&gate, "open").expect("gate");
    let manager = BackgroundOperationManager::new(sh_config(
        temp.path(),
        SUCCESS_WORKER,
        &[gate.display().to_string()],
    ))
    .expect("manager");

    let handle = manager
        .stage(StageRequest::new("staged://capture/1", "workspace-a"))
        .expect("stage");
    assert_eq!(handle.state, OperationState::Running);

    let record = wait_for_state(&manager, &handle.operation_id, OperationState::Succeeded);
    let summary = record.result_summary.expect("summary");
    assert_eq!((summary.entity_count, summary.relationship_count), (3, 2));
    assert_eq!(record.attempts, 1);
    assert!(!manager.status_artifact_path(&handle.operation_id).exists());

    let log = std::fs::read_to_string(record.log_path.expect("log path")).expect("worker log");
    assert!(log.contains(&format!("graph worker {}", handle.operation_id)));
    assert!(log.contains("staged://capture/1"));

    let events = manager
        .audit_log()
        .read_events()
        .expect("events")
        .into_iter()
        .filter(|event| event.operation_id == handle.operation_id)
        .map(|event| event.event)
        .collect::<Vec<_>>();
    assert_eq!(
        events,
        vec!["created", "started", "succeeded", "notification_emitted"]
    );
    manager.shutdown().expect("shutdown");
}

#[test]
fn integration_worker_failure_keeps_reported_error_info() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager =
        BackgroundOperationManager::new(sh_config(temp.path(), FAILING_WORKER, &[])).expect("manager");
    let handle = manager
        .stage(StageRequest::new("staged://capture/2", "workspace-a"))
        .expect("stage");

    let record = wait_for_state(&manager, &handle.operation_id, OperationState::Failed);
    let error_info = record.error_info.expect("error info");
    assert_eq!(error_info.code, "PY_IMPORT");
    assert_eq!(error_info.remediation, "Install graph extras.");
}

#[test]
fn integration_crashed_worker_without_artifact_fails_after_exit_grace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manager =
        BackgroundOperationManager::new(sh_config(temp.path(), CRASHING_WORKER, &[])).expect("manager");
    let handle = manager
        .stage(StageRequest::new("staged://capture/3", "workspace-a"))
        .expect("stage");

    let record = wait_for_state(&manager, &handle.operation_id, OperationState::Failed);
    assert_eq!(
        record.error_info.map(|info| info.code),
        Some("WORKER_EXITED".to_string())
    );
    let log = std::fs::read_to_string(record.log_path.expect("log path")).expect("log");
    assert!(log.contains("segfault simulation"));
}

#[test]
fn integration_backlog_rejects_then_drains_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gate = temp.path().join("gate");
    let manager = BackgroundOperationManager::new(
        sh_config(temp.path(), SUCCESS_WORKER, &[gate.display().to_string()]).with_limits(1, 1),
    )
    .expect("manager");

    let first = manager
        .stage(StageRequest::new("staged://capture/a", "workspace-a"))
        .expect("first");
    let second = manager
        .stage(StageRequest::new("staged://capture/b", "workspace-a"))
        .expect("second");
    assert_eq!(first.state, OperationState::Running);
    assert_eq!(second.state, OperationState::Queued);

    let error = manager
        .stage(StageRequest::new("staged://capture/c", "workspace-a"))
        .expect_err("backlog full");
    assert_eq!(error.code(), CAPACITY_EXCEEDED_CODE);
    assert!(matches!(error, StageError::CapacityExceeded { .. }));

    std::fs::write(&gate, "open").expect("open gate");
    let first_record = wait_for_state(&manager, &first.operation_id, OperationState::Succeeded);
    let second_record = wait_for_state(&manager, &second.operation_id, OperationState::Succeeded);
    assert!(
        second_record.started_unix_ms >= first_record.started_unix_ms,
        "queued operation starts after the running one"
    );
    assert_eq!(manager.capacity().running, 0);
}

#[test]
fn integration_restarted_manager_adopts_live_worker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let gate = temp.path().join("gate");
    let config = sh_config(temp.path(), SUCCESS_WORKER, &[gate.display().to_string()]);

    let operation_id = {
        let first = BackgroundOperationManager::new(config.clone()).expect("first manager");
        let handle = first
            .stage(StageRequest::new("staged://capture/restart", "workspace-a"))
            .expect("stage");
        first.shutdown().expect("shutdown");
        handle.operation_id
    };

    let second = BackgroundOperationManager::new(config).expect("second manager");
    let report = second.reconcile_on_startup();
    assert_eq!(report.resumed_alive, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(second.capacity().running, 1);

    std::fs::write(&gate, "open").expect("open gate");
    let record = wait_for_state(&second, &operation_id, OperationState::Succeeded);
    assert_eq!(record.attempts, 1, "live worker is not relaunched");
}
