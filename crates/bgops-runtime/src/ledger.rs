//! Durable operation ledger: one JSON document on disk plus a host-provided mirror.
//!
//! Every mutation rewrites the whole document through a temp file + rename so a
//! crash mid-write leaves the previous version intact. The JSON file wins over
//! the mirror whenever the two disagree.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bgops_core::{
    current_unix_timestamp_ms, is_atomic_temp_file_for, is_older_than_unix_ms, write_text_atomic,
};
use serde::{Deserialize, Serialize};

use crate::operation::{OperationRecord, OperationState, OperationStateFilter};

const LEDGER_SCHEMA_VERSION: u32 = 1;

fn ledger_schema_version() -> u32 {
    LEDGER_SCHEMA_VERSION
}

/// Fast key-value mirror supplied by the host for low-latency reads.
pub trait LedgerMirror: Send + Sync + Debug {
    fn put(&self, record: &OperationRecord);
    fn get(&self, operation_id: &str) -> Option<OperationRecord>;
    fn remove(&self, operation_id: &str);
    fn replace_all(&self, records: &[OperationRecord]);
}

/// In-process mirror used when the host provides none.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    records: Mutex<BTreeMap<String, OperationRecord>>,
}

impl MemoryMirror {
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LedgerMirror for MemoryMirror {
    fn put(&self, record: &OperationRecord) {
        lock_unpoisoned(&self.records).insert(record.operation_id.clone(), record.clone());
    }

    fn get(&self, operation_id: &str) -> Option<OperationRecord> {
        lock_unpoisoned(&self.records).get(operation_id).cloned()
    }

    fn remove(&self, operation_id: &str) {
        lock_unpoisoned(&self.records).remove(operation_id);
    }

    fn replace_all(&self, records: &[OperationRecord]) {
        let mut mirrored = lock_unpoisoned(&self.records);
        mirrored.clear();
        for record in records {
            mirrored.insert(record.operation_id.clone(), record.clone());
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default = "ledger_schema_version")]
    schema_version: u32,
    #[serde(default)]
    updated_unix_ms: u64,
    #[serde(default)]
    records: Vec<OperationRecord>,
}

/// Durable store of operation records.
///
/// Writes that fail (disk full, permissions) leave the in-memory state
/// authoritative for the session and are retried by the next mutation or
/// [`LedgerStore::flush`].
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    records: BTreeMap<String, OperationRecord>,
    mirror: Arc<dyn LedgerMirror>,
    dirty: bool,
}

impl LedgerStore {
    /// Loads the ledger at `path`, discarding temp files left by interrupted writes.
    ///
    /// An unparsable ledger is moved aside as `<name>.corrupt-<ms>` and a fresh
    /// ledger is started rather than failing host startup.
    pub fn open(path: impl Into<PathBuf>, mirror: Arc<dyn LedgerMirror>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
            remove_stale_temp_files(&path, parent);
        }

        let records = match load_ledger_document(&path) {
            Ok(document) => document
                .records
                .into_iter()
                .map(|record| (record.operation_id.clone(), record))
                .collect::<BTreeMap<_, _>>(),
            Err(error) => {
                let quarantine = PathBuf::from(format!(
                    "{}.corrupt-{}",
                    path.display(),
                    current_unix_timestamp_ms()
                ));
                tracing::warn!(
                    path = %path.display(),
                    quarantine = %quarantine.display(),
                    error = %format!("{error:#}"),
                    "ledger unreadable; starting a fresh ledger"
                );
                std::fs::rename(&path, &quarantine).with_context(|| {
                    format!(
                        "failed to move corrupt ledger {} aside",
                        path.display()
                    )
                })?;
                BTreeMap::new()
            }
        };

        let store = Self {
            path,
            records,
            mirror,
            dirty: false,
        };
        store.mirror.replace_all(&store.records.values().cloned().collect::<Vec<_>>());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True while the on-disk document lags the in-memory state.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, operation_id: &str) -> Option<&OperationRecord> {
        self.records.get(operation_id)
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.records.contains_key(operation_id)
    }

    /// Records matching `filter`, newest first.
    pub fn list(&self, filter: Option<OperationStateFilter>) -> Vec<OperationRecord> {
        let mut records = self
            .records
            .values()
            .filter(|record| filter.map_or(true, |filter| filter.matches(record.state)))
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            right
                .created_unix_ms
                .cmp(&left.created_unix_ms)
                .then_with(|| right.operation_id.cmp(&left.operation_id))
        });
        records
    }

    /// Records in staging order (oldest first).
    pub fn records_by_creation(&self) -> Vec<OperationRecord> {
        let mut records = self.records.values().cloned().collect::<Vec<_>>();
        records.sort_by(|left, right| {
            left.created_unix_ms
                .cmp(&right.created_unix_ms)
                .then_with(|| left.operation_id.cmp(&right.operation_id))
        });
        records
    }

    /// Inserts or replaces a record and persists. Returns whether the write reached disk.
    pub fn put(&mut self, record: OperationRecord) -> bool {
        self.records
            .insert(record.operation_id.clone(), record.clone());
        self.dirty = true;
        let persisted = self.persist_logged();
        if persisted {
            self.mirror.put(&record);
        }
        persisted
    }

    /// Removes a terminal record. Active records are never deleted.
    pub fn remove(&mut self, operation_id: &str) -> Result<Option<OperationRecord>> {
        match self.records.get(operation_id) {
            None => return Ok(None),
            Some(record) if record.state.is_active() => bail!(
                "operation '{operation_id}' is {} and cannot be removed",
                record.state.as_str()
            ),
            Some(_) => {}
        }
        let removed = self.records.remove(operation_id);
        self.dirty = true;
        self.mirror.remove(operation_id);
        self.persist_logged();
        Ok(removed)
    }

    /// Drops succeeded/failed records whose finish time is older than their retention window.
    pub fn sweep_expired(
        &mut self,
        success_retention_ms: u64,
        failure_retention_ms: u64,
        now_ms: u64,
    ) -> Vec<OperationRecord> {
        let expired_ids = self
            .records
            .values()
            .filter(|record| {
                let retention_ms = match record.state {
                    OperationState::Succeeded => success_retention_ms,
                    OperationState::Failed => failure_retention_ms,
                    _ => return false,
                };
                let finished = record.finished_unix_ms.unwrap_or(record.updated_unix_ms);
                is_older_than_unix_ms(finished, retention_ms, now_ms)
            })
            .map(|record| record.operation_id.clone())
            .collect::<Vec<_>>();
        if expired_ids.is_empty() {
            return Vec::new();
        }

        let mut removed = Vec::with_capacity(expired_ids.len());
        for operation_id in expired_ids {
            if let Some(record) = self.records.remove(&operation_id) {
                self.mirror.remove(&operation_id);
                removed.push(record);
            }
        }
        self.dirty = true;
        self.persist_logged();
        removed
    }

    /// Retries a pending write. Errors are returned so shutdown can report them.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.persist()?;
        self.mirror
            .replace_all(&self.records.values().cloned().collect::<Vec<_>>());
        Ok(())
    }

    fn persist_logged(&mut self) -> bool {
        match self.persist() {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    records = self.records.len(),
                    error = %format!("{error:#}"),
                    "ledger write failed; will retry on next mutation"
                );
                false
            }
        }
    }

    fn persist(&mut self) -> Result<()> {
        let document = LedgerDocument {
            schema_version: LEDGER_SCHEMA_VERSION,
            updated_unix_ms: current_unix_timestamp_ms(),
            records: self.records.values().cloned().collect(),
        };
        let mut payload =
            serde_json::to_string_pretty(&document).context("failed to encode ledger")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

fn load_ledger_document(path: &Path) -> Result<LedgerDocument> {
    if !path.exists() {
        return Ok(LedgerDocument {
            schema_version: LEDGER_SCHEMA_VERSION,
            updated_unix_ms: 0,
            records: Vec::new(),
        });
    }
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(LedgerDocument {
            schema_version: LEDGER_SCHEMA_VERSION,
            updated_unix_ms: 0,
            records: Vec::new(),
        });
    }
    let document = serde_json::from_str::<LedgerDocument>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if document.schema_version > LEDGER_SCHEMA_VERSION {
        bail!(
            "ledger {} has unsupported schema version {}",
            path.display(),
            document.schema_version
        );
    }
    Ok(document)
}

fn remove_stale_temp_files(path: &Path, dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let candidate = entry.path();
        if !is_atomic_temp_file_for(path, &candidate) {
            continue;
        }
        match std::fs::remove_file(&candidate) {
            Ok(()) => tracing::debug!(
                path = %candidate.display(),
                "removed temp file from interrupted ledger write"
            ),
            Err(error) => tracing::warn!(
                path = %candidate.display(),
                error = %error,
                "failed to remove stale ledger temp file"
            ),
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
