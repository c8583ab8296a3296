use std::collections::HashSet;
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::error::LaunchError;
use crate::operation::OperationKind;

/// Everything a worker needs to find its input and report its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub payload_ref: String,
    pub status_path: PathBuf,
    pub log_path: PathBuf,
}

impl WorkerInvocation {
    /// Arguments appended after the configured worker program and its fixed args.
    pub fn cli_args(&self) -> Vec<String> {
        vec![
            "--operation-id".to_string(),
            self.operation_id.clone(),
            "--payload-ref".to_string(),
            self.payload_ref.clone(),
            "--status-path".to_string(),
            self.status_path.display().to_string(),
            "--kind".to_string(),
            self.kind.as_str().to_string(),
        ]
    }
}

/// Starts detached workers and answers liveness probes for their process ids.
pub trait ProcessLauncher: Send + Sync + Debug {
    /// Spawns without waiting for exit and returns the OS process id.
    fn spawn(&self, invocation: &WorkerInvocation) -> Result<u32, LaunchError>;

    /// Returns false when the process is gone or cannot be verified.
    fn is_alive(&self, process_id: u32) -> bool;
}

/// Launches the configured worker as a detached OS process.
///
/// The child gets its own process group, a null stdin, and appends stdout and
/// stderr to the per-operation log. A reaper thread waits on it so exited
/// workers do not linger as zombies; nothing here ever kills a worker.
#[derive(Debug, Clone)]
pub struct DetachedProcessLauncher {
    program: String,
    args: Vec<String>,
    /// Children spawned by this launcher that have not been reaped yet.
    children: Arc<Mutex<HashSet<u32>>>,
}

impl DetachedProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    fn open_log(&self, invocation: &WorkerInvocation) -> Result<std::fs::File, LaunchError> {
        if let Some(parent) = invocation.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                LaunchError::new(
                    self.program.as_str(),
                    format!("failed to create log dir {}: {error}", parent.display()),
                )
            })?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&invocation.log_path)
            .map_err(|error| {
                LaunchError::new(
                    self.program.as_str(),
                    format!(
                        "failed to open worker log {}: {error}",
                        invocation.log_path.display()
                    ),
                )
            })
    }
}

impl ProcessLauncher for DetachedProcessLauncher {
    fn spawn(&self, invocation: &WorkerInvocation) -> Result<u32, LaunchError> {
        if self.program.trim().is_empty() {
            return Err(LaunchError::new("", "worker program is not configured"));
        }
        let stdout_log = self.open_log(invocation)?;
        let stderr_log = stdout_log.try_clone().map_err(|error| {
            LaunchError::new(
                self.program.as_str(),
                format!("failed to share worker log handle: {error}"),
            )
        })?;

        let mut command = Command::new(self.program.as_str());
        command
            .args(&self.args)
            .args(invocation.cli_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|error| LaunchError::new(self.program.as_str(), error.to_string()))?;
        let process_id = child.id();
        lock_unpoisoned(&self.children).insert(process_id);

        let children = Arc::clone(&self.children);
        let reaper = std::thread::Builder::new()
            .name(format!("bgops-reaper-{process_id}"))
            .spawn(move || {
                let _ = child.wait();
                lock_unpoisoned(&children).remove(&process_id);
            });
        if let Err(error) = reaper {
            tracing::warn!(
                process_id,
                error = %error,
                "failed to start worker reaper thread; exited worker may linger until host exit"
            );
        }

        tracing::debug!(
            operation_id = %invocation.operation_id,
            process_id,
            program = %self.program,
            log_path = %invocation.log_path.display(),
            "spawned detached worker"
        );
        Ok(process_id)
    }

    fn is_alive(&self, process_id: u32) -> bool {
        lock_unpoisoned(&self.children).contains(&process_id) || process_is_alive(process_id)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Signal-0 liveness probe. A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn process_is_alive(process_id: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(process_id) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Liveness cannot be verified without a signal-0 probe; callers treat the worker as gone.
#[cfg(not(unix))]
pub fn process_is_alive(_process_id: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::{process_is_alive, DetachedProcessLauncher, ProcessLauncher, WorkerInvocation};
    use crate::operation::OperationKind;
    use std::time::{Duration, Instant};

    fn invocation(root: &std::path::Path) -> WorkerInvocation {
        WorkerInvocation {
            operation_id: "op-launch".to_string(),
            kind: OperationKind::GraphConstruction,
            payload_ref: "staged://doc/1".to_string(),
            status_path: root.join("status").join("op-launch.json"),
            log_path: root.join("logs").join("op-launch.log"),
        }
    }

    #[test]
    fn unit_cli_args_encode_operation_payload_and_status_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let args = invocation(temp.path()).cli_args();
        assert_eq!(args[0], "--operation-id");
        assert_eq!(args[1], "op-launch");
        assert_eq!(args[3], "staged://doc/1");
        assert!(args[5].ends_with("op-launch.json"));
        assert_eq!(args[7], "graph-construction");
    }

    #[test]
    fn regression_missing_executable_reports_launch_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let launcher = DetachedProcessLauncher::new("bgops-definitely-missing-worker", Vec::new());
        let error = launcher
            .spawn(&invocation(temp.path()))
            .expect_err("missing binary must fail");
        assert_eq!(error.program, "bgops-definitely-missing-worker");
    }

    #[cfg(unix)]
    #[test]
    fn functional_detached_worker_writes_log_and_is_reaped_after_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let launcher = DetachedProcessLauncher::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo worker-started \"$2\"".to_string(),
                "worker".to_string(),
            ],
        );
        let invocation = invocation(temp.path());
        let process_id = launcher.spawn(&invocation).expect("spawn");
        assert!(process_id > 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while launcher.is_alive(process_id) {
            assert!(Instant::now() < deadline, "worker did not exit");
            std::thread::sleep(Duration::from_millis(20));
        }
        let log = std::fs::read_to_string(&invocation.log_path).expect("read worker log");
        assert!(log.contains("worker-started op-launch"));
    }

    #[cfg(unix)]
    #[test]
    fn unit_liveness_probe_recognises_self_and_rejects_invalid_ids() {
        assert!(process_is_alive(std::process::id()));
        assert!(!process_is_alive(0));
        assert!(!process_is_alive(u32::MAX));
    }
}
