//! Size-capped NDJSON files kept as numbered generations.
//!
//! The active file is `<path>`; older generations are `<path>.1` (newest)
//! through `<path>.<max_files - 1>` (oldest).

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;
const MAX_BYTES_ENV: &str = "BGOPS_LOG_ROTATION_MAX_BYTES";
const MAX_FILES_ENV: &str = "BGOPS_LOG_ROTATION_MAX_FILES";

/// How large the active file may grow and how many generations (active included) survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl LogRotationPolicy {
    /// `BGOPS_LOG_ROTATION_*` overrides; unparsable or zero values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_bytes: positive_env(MAX_BYTES_ENV).unwrap_or(defaults.max_bytes),
            max_files: positive_env(MAX_FILES_ENV).unwrap_or(defaults.max_files),
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }

    fn would_overflow(self, current_len: u64, line: &str) -> bool {
        let incoming = u64::try_from(line.len()).unwrap_or(u64::MAX).saturating_add(1);
        current_len > 0 && current_len.saturating_add(incoming) > self.max_bytes
    }
}

fn positive_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Appends `line` plus a newline, starting a new generation first if the line would not fit.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() {
        let current_len = match std::fs::metadata(path) {
            Ok(metadata) => metadata.len(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => {
                return Err(error).with_context(|| format!("failed to stat {}", path.display()))
            }
        };
        if policy.would_overflow(current_len, line) {
            shift_generations(path, policy.max_files)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

/// Existing generations of `path`, oldest first, ending with the active file.
pub fn retained_log_files(path: &Path, policy: LogRotationPolicy) -> Vec<PathBuf> {
    let mut files = (1..policy.max_files.max(1))
        .rev()
        .map(|generation| generation_path(path, generation))
        .collect::<Vec<_>>();
    files.push(path.to_path_buf());
    files.retain(|file| file.is_file());
    files
}

fn generation_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Drops the oldest generation, renames `.n` to `.n+1`, and moves the active file to `.1`.
fn shift_generations(path: &Path, max_files: usize) -> Result<()> {
    let backups = max_files.saturating_sub(1);
    if backups == 0 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }

    let oldest = generation_path(path, backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)
            .with_context(|| format!("failed to drop {}", oldest.display()))?;
    }
    for generation in (1..backups).rev() {
        let from = generation_path(path, generation);
        if from.exists() {
            let to = generation_path(path, generation + 1);
            std::fs::rename(&from, &to)
                .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))?;
        }
    }
    let newest_backup = generation_path(path, 1);
    std::fs::rename(path, &newest_backup).with_context(|| {
        format!(
            "failed to move {} to {}",
            path.display(),
            newest_backup.display()
        )
    })
}
