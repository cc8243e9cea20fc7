//! Write-ahead log.
//!
//! One JSON file per in-flight transaction, stored outside the vault so a
//! cloud-sync process never sees it. Existence of a WAL entry between
//! `prepare` and a terminal phase is what makes a crash recoverable: boot
//! recovery (`recovery.rs`) just has to find these files and roll each one
//! back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::writer::write_atomic;

pub const SCHEMA_VERSION: u32 = 1;

const README: &str = "\
This directory holds the write-ahead log for the vault rename engine.

Each file is one in-flight or recently-failed rename transaction. A file here
means the transaction reached at least the `prepare` phase; its presence is
what lets the engine recover cleanly after a crash.

Entries are deleted automatically on success or on a successful rollback.
An entry that survives with phase `abort` means automatic rollback could not
fully restore the vault; see that file's `recovery_instructions` field for
what to do. Retention for such entries is indefinite — delete them manually
once you've confirmed the vault is back in a consistent state.

It is safe to delete this entire directory while no rename is in flight.
";

/// The five-phase protocol's state, plus the terminal `abort` state reached
/// when any phase fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Prepare,
    Validate,
    Commit,
    Success,
    Abort,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Plan => "plan",
            Phase::Prepare => "prepare",
            Phase::Validate => "validate",
            Phase::Commit => "commit",
            Phase::Success => "success",
            Phase::Abort => "abort",
        };
        f.write_str(s)
    }
}

/// Pre-image record for one file the transaction touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedFile {
    pub path: PathBuf,
    pub pre_image_sha256: String,
    pub pre_image_bytes_len: u64,
}

/// The immutable description of a transaction's intended effect, written
/// once in phase 1 and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub correlation_id: uuid::Uuid,
    pub operation: String,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub update_links: bool,
    pub affected_files: Vec<AffectedFile>,
}

/// One commit-phase step that actually executed, recorded in order so abort
/// knows exactly how far to walk backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PerformedStep {
    Rename { from: PathBuf, to: PathBuf },
    Promoted { path: PathBuf, pre_image: Vec<u8> },
}

/// A single persisted transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub schema_version: u32,
    pub correlation_id: uuid::Uuid,
    pub operation: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub manifest: Manifest,
    pub rendered_files: HashMap<PathBuf, PathBuf>,
    pub performed_steps: Vec<PerformedStep>,
    pub recovery_instructions: Option<String>,
}

impl WalEntry {
    pub fn new(manifest: Manifest) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            correlation_id: manifest.correlation_id,
            operation: manifest.operation.clone(),
            phase: Phase::Plan,
            started_at: now,
            updated_at: now,
            manifest,
            rendered_files: HashMap::new(),
            performed_steps: Vec::new(),
            recovery_instructions: None,
        }
    }

    pub(crate) fn file_name(&self) -> String {
        file_name_for(self.started_at, self.correlation_id)
    }
}

fn file_name_for(started_at: DateTime<Utc>, correlation_id: uuid::Uuid) -> String {
    format!(
        "{}-rename-{correlation_id}.json",
        started_at.format("%Y%m%dT%H%M%S%.6fZ")
    )
}

/// Durable, crash-safe storage for WAL entries, rooted outside the vault.
pub struct WalManager {
    dir: PathBuf,
}

impl WalManager {
    /// Creates the state directory (and its README) on first use.
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let readme_path = dir.join("README.txt");
        if !readme_path.exists() {
            std::fs::write(&readme_path, README)?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a brand-new entry. Durable before returning.
    pub fn write(&self, entry: &WalEntry) -> Result<()> {
        let path = self.dir.join(entry.file_name());
        let bytes = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &bytes)
    }

    /// Reads, mutates, and durably rewrites the entry for `correlation_id`.
    /// `updated_at` is bumped automatically after `mutator` runs.
    pub fn update(
        &self,
        correlation_id: uuid::Uuid,
        mutator: impl FnOnce(&mut WalEntry),
    ) -> Result<WalEntry> {
        let mut entry = self.read(correlation_id)?;
        mutator(&mut entry);
        entry.updated_at = Utc::now();

        let path = self.dir.join(entry.file_name());
        let bytes = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&path, &bytes)?;
        Ok(entry)
    }

    /// Loads a single entry by correlation id.
    pub fn read(&self, correlation_id: uuid::Uuid) -> Result<WalEntry> {
        let path = self.find_path(correlation_id)?;
        self.read_at(&path)
    }

    fn read_at(&self, path: &Path) -> Result<WalEntry> {
        let bytes = std::fs::read(path)?;
        let entry: WalEntry = serde_json::from_slice(&bytes)?;

        if entry.schema_version != SCHEMA_VERSION {
            return Err(EngineError::WalSchemaMismatch {
                found: entry.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        let filename_id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !filename_id.contains(&entry.correlation_id.to_string()) {
            return Err(EngineError::WalCorrupt(filename_id));
        }

        Ok(entry)
    }

    /// Removes the entry for `correlation_id`. Missing is not an error.
    pub fn delete(&self, correlation_id: uuid::Uuid) -> Result<()> {
        if let Ok(path) = self.find_path(correlation_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Every entry whose `updated_at` is older than `min_age`. Entries newer
    /// than that are assumed to belong to a transaction still in flight.
    /// Corrupt files are logged and skipped, never propagated.
    pub fn scan_pending(&self, min_age: chrono::Duration) -> Result<Vec<WalEntry>> {
        let cutoff = Utc::now() - min_age;
        let mut pending = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(pending),
            Err(err) => return Err(err.into()),
        };

        for dir_entry in entries.filter_map(|e| e.ok()) {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_at(&path) {
                Ok(entry) if entry.updated_at < cutoff => pending.push(entry),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping corrupt WAL entry");
                }
            }
        }

        Ok(pending)
    }

    fn find_path(&self, correlation_id: uuid::Uuid) -> Result<PathBuf> {
        let needle = correlation_id.to_string();
        let entries = std::fs::read_dir(&self.dir)?;
        for dir_entry in entries.filter_map(|e| e.ok()) {
            let path = dir_entry.path();
            if path
                .file_name()
                .map(|n| n.to_string_lossy().contains(&needle))
                .unwrap_or(false)
            {
                return Ok(path);
            }
        }
        Err(EngineError::WalCorrupt(format!(
            "no WAL entry found for correlation id {correlation_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_manifest() -> Manifest {
        Manifest {
            correlation_id: uuid::Uuid::new_v4(),
            operation: "rename".to_string(),
            old_path: PathBuf::from("/vault/Old.md"),
            new_path: PathBuf::from("/vault/New.md"),
            update_links: true,
            affected_files: vec![],
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(dir.path().join("state")).unwrap();
        let entry = WalEntry::new(sample_manifest());
        let id = entry.correlation_id;

        wal.write(&entry).unwrap();
        let loaded = wal.read(id).unwrap();

        assert_eq!(loaded.correlation_id, id);
        assert_eq!(loaded.phase, Phase::Plan);
    }

    #[test]
    fn update_bumps_phase_and_timestamp() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(dir.path().join("state")).unwrap();
        let entry = WalEntry::new(sample_manifest());
        let id = entry.correlation_id;
        wal.write(&entry).unwrap();

        let updated = wal.update(id, |e| e.phase = Phase::Prepare).unwrap();
        assert_eq!(updated.phase, Phase::Prepare);
        assert!(updated.updated_at >= entry.updated_at);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(dir.path().join("state")).unwrap();
        let entry = WalEntry::new(sample_manifest());
        let id = entry.correlation_id;
        wal.write(&entry).unwrap();

        wal.delete(id).unwrap();
        wal.delete(id).unwrap();
        assert!(wal.read(id).is_err());
    }

    #[test]
    fn scan_pending_filters_by_age() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(dir.path().join("state")).unwrap();
        let entry = WalEntry::new(sample_manifest());
        wal.write(&entry).unwrap();

        let none_yet = wal.scan_pending(chrono::Duration::hours(1)).unwrap();
        assert!(none_yet.is_empty());

        let all = wal.scan_pending(chrono::Duration::zero()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn readme_is_created_on_first_use() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        WalManager::new(state_dir.clone()).unwrap();
        assert!(state_dir.join("README.txt").exists());
    }
}
