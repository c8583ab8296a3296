use anyhow::{anyhow, bail, Context, Result};
use bgops_runtime::{
    write_status_artifact, BackgroundOperationManager, ErrorInfo, ResultSummary, StageRequest,
    StatusArtifact,
};
use serde_json::{json, Value};

use crate::cli_args::{
    CliArtifactStatus, ListArgs, ManagerArgs, StageArgs, StatusArgs, WriteStatusArgs,
};

pub(crate) fn open_manager(args: &ManagerArgs) -> Result<BackgroundOperationManager> {
    BackgroundOperationManager::new(args.to_config()).with_context(|| {
        format!(
            "failed to open background operation state at {}",
            args.state_dir.display()
        )
    })
}

pub(crate) fn execute_stage(manager: &BackgroundOperationManager, args: &StageArgs) -> Result<Value> {
    let mut request = StageRequest::new(args.payload_ref.as_str(), args.workspace_scope.as_str())
        .with_kind(args.kind.into());
    if let Some(digest) = args.content_digest.as_deref() {
        request = request.with_content_digest(digest);
    }
    let handle = manager
        .stage(request)
        .map_err(|error| anyhow!("{}: {error}", error.code()))?;
    Ok(serde_json::to_value(handle)?)
}

pub(crate) fn execute_status(
    manager: &BackgroundOperationManager,
    args: &StatusArgs,
) -> Result<Value> {
    let Some(record) = manager.get_status(&args.operation_id) else {
        bail!("operation '{}' not found", args.operation_id);
    };
    Ok(serde_json::to_value(record)?)
}

pub(crate) fn execute_list(manager: &BackgroundOperationManager, args: &ListArgs) -> Result<Value> {
    let records = manager.list(args.state);
    Ok(json!({
        "count": records.len(),
        "operations": records,
    }))
}

pub(crate) fn execute_capacity(manager: &BackgroundOperationManager) -> Result<Value> {
    manager.poll_once();
    Ok(serde_json::to_value(manager.capacity())?)
}

pub(crate) fn execute_reconcile(manager: &BackgroundOperationManager) -> Result<Value> {
    let report = manager.reconcile_on_startup();
    Ok(json!({
        "report": report,
        "capacity": manager.capacity(),
    }))
}

pub(crate) fn execute_sweep(manager: &BackgroundOperationManager) -> Result<Value> {
    Ok(serde_json::to_value(manager.sweep_retention())?)
}

pub(crate) async fn execute_watch(manager: &BackgroundOperationManager) -> Result<Value> {
    let reconcile = manager.reconcile_on_startup();
    manager.start_poller();
    tracing::info!(
        state_dir = %manager.config().state_dir.display(),
        poll_interval_ms = manager.config().poll_interval_ms,
        "watching background operations; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    manager.shutdown()?;
    Ok(json!({
        "reconcile": reconcile,
        "capacity": manager.capacity(),
    }))
}

pub(crate) fn execute_write_status(args: &WriteStatusArgs) -> Result<Value> {
    let artifact = match args.status {
        CliArtifactStatus::Succeeded => StatusArtifact::succeeded(
            args.operation_id.as_str(),
            ResultSummary {
                entity_count: args.entity_count,
                relationship_count: args.relationship_count,
                elapsed_ms: args.elapsed_ms,
            },
        ),
        CliArtifactStatus::Failed => StatusArtifact::failed(
            args.operation_id.as_str(),
            ErrorInfo::new(
                args.error_code.as_str(),
                args.error_message.as_str(),
                args.remediation.as_str(),
            ),
        ),
    };
    write_status_artifact(&args.status_path, &artifact)?;
    Ok(serde_json::to_value(artifact)?)
}

#[cfg(test)]
mod tests {
    use super::{
        execute_capacity, execute_list, execute_stage, execute_status, execute_write_status,
        open_manager,
    };
    use crate::cli_args::{Cli, CliCommand};
    use bgops_runtime::{read_status_artifact, ArtifactStatus};
    use clap::Parser;

    fn cli(state_dir: &std::path::Path, rest: &[&str]) -> Cli {
        let mut args = vec![
            "bgops".to_string(),
            "--state-dir".to_string(),
            state_dir.display().to_string(),
            "--worker-program".to_string(),
            "bgops-definitely-missing-worker".to_string(),
        ];
        args.extend(rest.iter().map(|value| value.to_string()));
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn functional_stage_with_missing_worker_reports_launch_failure_and_keeps_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let parsed = cli(
            temp.path(),
            &["stage", "--payload-ref", "staged://capture/1", "--scope", "ws"],
        );
        let manager = open_manager(&parsed.manager).expect("manager");
        let CliCommand::Stage(stage) = parsed.command else {
            panic!("expected stage");
        };
        let error = execute_stage(&manager, &stage).expect_err("missing worker");
        assert!(error.to_string().starts_with("LAUNCH_FAILED"));

        let listed = execute_list(&manager, &crate::cli_args::ListArgs { state: None })
            .expect("list");
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["operations"][0]["state"], "failed");
        assert_eq!(
            listed["operations"][0]["error_info"]["code"],
            "LAUNCH_FAILED"
        );

        let capacity = execute_capacity(&manager).expect("capacity");
        assert_eq!(capacity["running"], 0);
        assert_eq!(capacity["max_running"], 2);
    }

    #[test]
    fn regression_status_of_unknown_operation_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let parsed = cli(temp.path(), &["status", "op-missing"]);
        let manager = open_manager(&parsed.manager).expect("manager");
        let CliCommand::Status(status) = parsed.command else {
            panic!("expected status");
        };
        let error = execute_status(&manager, &status).expect_err("missing");
        assert!(error.to_string().contains("op-missing"));
    }

    #[test]
    fn functional_write_status_publishes_parseable_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status").join("op-5.json");
        let path_arg = path.display().to_string();
        let parsed = cli(
            temp.path(),
            &[
                "write-status",
                "--status-path",
                path_arg.as_str(),
                "--operation-id",
                "op-5",
                "--status",
                "succeeded",
                "--entity-count",
                "7",
            ],
        );
        let CliCommand::WriteStatus(args) = parsed.command else {
            panic!("expected write-status");
        };
        let output = execute_write_status(&args).expect("write");
        assert_eq!(output["resultSummary"]["entityCount"], 7);

        let artifact = read_status_artifact(&path, "op-5")
            .expect("read")
            .expect("present");
        assert_eq!(artifact.status, ArtifactStatus::Succeeded);
    }
}
