use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Writes text using a temp file + flush + rename so readers never observe partial data.
///
/// The temp file lives next to `path` so the final rename stays on one filesystem.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.exists() && path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let temp_path = parent_dir.join(format!(
        "{}{}-{}-{}",
        temp_file_prefix(path),
        std::process::id(),
        current_unix_timestamp_ms(),
        TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let write_result = (|| -> Result<()> {
        let mut file = std::fs::File::create(&temp_path).with_context(|| {
            format!("failed to create temporary file {}", temp_path.display())
        })?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush temporary file {}", temp_path.display()))?;
        Ok(())
    })();
    if let Err(error) = write_result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error);
    }

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Returns true when `candidate` is a temp file produced by [`write_text_atomic`] for `target`.
///
/// Used to clean up leftovers from writers that were killed before the rename.
pub fn is_atomic_temp_file_for(target: &Path, candidate: &Path) -> bool {
    let same_dir = match (target.parent(), candidate.parent()) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    };
    if !same_dir {
        return false;
    }
    candidate
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(temp_file_prefix(target).as_str()))
        .unwrap_or(false)
}

fn temp_file_prefix(path: &Path) -> String {
    format!(
        ".{}.tmp-",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("bgops-state")
    )
}
