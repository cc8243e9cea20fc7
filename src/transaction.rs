//! The five-phase transaction protocol: plan, prepare, validate, commit,
//! success — with abort-and-rollback available from any of the middle three.
//!
//! `TransactionManager` is the only thing in this crate allowed to mutate a
//! vault file or the WAL at the same time. Everything upstream of it (the
//! scanner, the rewriter, the writer) is a pure or idempotent building block;
//! this module is where their results become one all-or-nothing operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result, TransactionFailure};
use crate::hash::sha256_hex;
use crate::paths::{file_stem_string, normalize_in_vault, with_markdown_extension};
use crate::rewriter::{render, RenderedFile};
use crate::scanner::{scan_vault, ScanOptions};
use crate::wal::{AffectedFile, Manifest, Phase, PerformedStep, WalEntry, WalManager};
use crate::writer::{read_with_retry, rename_atomic, staged_path, write_atomic};

/// What the plan phase produced: the manifest the WAL will carry, plus the
/// pre-rendered content changes (never written to disk yet).
struct PlannedTransaction {
    manifest: Manifest,
    rendered: BTreeMap<PathBuf, RenderedFile>,
    link_holding_paths: BTreeSet<PathBuf>,
    matching_link_count: usize,
}

/// A phase-3 failure that isn't necessarily an I/O error.
enum ValidateFailure {
    Stale(PathBuf),
    Io(EngineError),
}

/// Successful outcome of a rename, including per-phase timing for callers
/// that want to surface it (the CLI logs it at `info`).
#[derive(Debug, Clone)]
pub struct RenameOutcome {
    pub correlation_id: Uuid,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub files_affected: usize,
    pub phase_timings_ms: HashMap<String, u64>,
}

/// What a dry run would do, without doing any of it.
#[derive(Debug, Clone)]
pub struct DryRunPreview {
    pub operation: &'static str,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub will_update_links: bool,
    pub files_affected: usize,
    pub link_updates: Option<LinkUpdatesPreview>,
    pub transaction_phases: Vec<&'static str>,
    pub estimated_time_ms: (u64, u64),
}

#[derive(Debug, Clone)]
pub struct LinkUpdatesPreview {
    pub files_with_links: usize,
    pub affected_paths: Vec<PathBuf>,
    pub total_references: usize,
}

/// Owns the vault root and the WAL, and serializes every transaction through
/// a mutex — the protocol is synchronous by design (§5), so at most one
/// rename is ever in flight per process.
pub struct TransactionManager {
    vault_root: PathBuf,
    wal: WalManager,
    lock: Mutex<()>,
}

impl TransactionManager {
    pub fn new(vault_root: PathBuf, wal: WalManager) -> Result<Self> {
        let vault_root = vault_root
            .canonicalize()
            .map_err(|_| EngineError::InvalidPath(vault_root))?;
        Ok(Self {
            vault_root,
            wal,
            lock: Mutex::new(()),
        })
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    /// Phase 1 only, exposed for callers that just want a preview. Reads
    /// files but never writes — no WAL entry, no staged content.
    pub fn dry_run(
        &self,
        old_input: &Path,
        new_stem: &str,
        update_links: bool,
    ) -> Result<DryRunPreview> {
        let planned = self.plan(old_input, new_stem, update_links)?;
        let files_affected = planned.manifest.affected_files.len();

        let link_updates = update_links.then(|| LinkUpdatesPreview {
            files_with_links: planned.link_holding_paths.len(),
            affected_paths: planned.link_holding_paths.iter().cloned().collect(),
            total_references: planned.matching_link_count,
        });

        let estimated_time_ms = estimate_time_ms(files_affected);

        Ok(DryRunPreview {
            operation: "rename",
            old_path: planned.manifest.old_path,
            new_path: planned.manifest.new_path,
            will_update_links: update_links,
            files_affected,
            link_updates,
            transaction_phases: vec!["plan", "prepare", "validate", "commit", "success"],
            estimated_time_ms,
        })
    }

    /// Runs the full protocol. Either every affected file ends up consistent
    /// with the rename, or (best-effort) none of them do.
    #[instrument(skip(self), fields(old = %old_input.display(), new_stem))]
    pub fn rename(
        &self,
        old_input: &Path,
        new_stem: &str,
        update_links: bool,
    ) -> Result<RenameOutcome> {
        let _guard = self.lock.lock();
        let mut timings = HashMap::new();

        let t = Instant::now();
        let planned = self.plan(old_input, new_stem, update_links)?;
        timings.insert("plan".to_string(), t.elapsed().as_millis() as u64);
        let correlation_id = planned.manifest.correlation_id;

        let t = Instant::now();
        let mut entry = self.prepare(&planned)?;
        timings.insert("prepare".to_string(), t.elapsed().as_millis() as u64);

        let t = Instant::now();
        if let Err(failure) = self.validate(&mut entry, &planned) {
            let transaction_failure = self.abort(entry);
            return Err(match failure {
                ValidateFailure::Stale(path) => {
                    EngineError::TransactionStaleContent(transaction_failure, path)
                }
                ValidateFailure::Io(_) => {
                    EngineError::TransactionValidateFailed(transaction_failure)
                }
            });
        }
        timings.insert("validate".to_string(), t.elapsed().as_millis() as u64);

        let t = Instant::now();
        if let Err(_err) = self.do_commit(&mut entry, &planned) {
            let transaction_failure = self.abort(entry);
            return Err(EngineError::TransactionCommitFailed(transaction_failure));
        }
        timings.insert("commit".to_string(), t.elapsed().as_millis() as u64);

        let t = Instant::now();
        self.succeed(&entry)?;
        timings.insert("success".to_string(), t.elapsed().as_millis() as u64);

        info!(
            %correlation_id,
            files_affected = planned.manifest.affected_files.len(),
            "rename committed"
        );

        Ok(RenameOutcome {
            correlation_id,
            old_path: planned.manifest.old_path,
            new_path: planned.manifest.new_path,
            files_affected: planned.manifest.affected_files.len(),
            phase_timings_ms: timings,
        })
    }

    /// Rolls back a transaction found by boot recovery (or anyone else who
    /// already knows its correlation id). Idempotent: rolling back an entry
    /// that was already fully reversed just deletes the WAL file.
    pub fn rollback(&self, correlation_id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock();
        let entry = self.wal.read(correlation_id)?;
        let failure = self.abort(entry);
        Ok(failure.rolled_back)
    }

    // ---- phase 1: plan ----------------------------------------------------

    pub(crate) fn plan(&self, old_input: &Path, new_stem: &str, update_links: bool) -> Result<PlannedTransaction> {
        let old_path = normalize_in_vault(&self.vault_root, old_input)?;
        if !old_path.is_file() {
            return Err(EngineError::FileNotFound(old_path));
        }

        let old_stem = file_stem_string(&old_path);
        let parent = old_path
            .parent()
            .ok_or_else(|| EngineError::InvalidPath(old_path.clone()))?;
        let candidate_new_path = with_markdown_extension(parent, new_stem.trim());
        let new_path = normalize_in_vault(&self.vault_root, &candidate_new_path)?;

        if new_path.exists() {
            return Err(EngineError::FileExists(new_path));
        }

        // Everything after this point only fails due to I/O, so wrap it with
        // the correlation id we're about to mint rather than letting raw
        // `Io`/`RenderIo` errors escape with no transaction context.
        let correlation_id = Uuid::new_v4();
        let new_stem_clean = file_stem_string(&new_path);

        let body = || -> Result<(BTreeSet<PathBuf>, usize, Vec<AffectedFile>, BTreeMap<PathBuf, RenderedFile>)> {
            let opts = ScanOptions::for_rename();
            let mut link_holding_paths: BTreeSet<PathBuf> = BTreeSet::new();
            let mut matching_link_count = 0usize;

            if update_links {
                let links = scan_vault(&self.vault_root, &opts)?;
                for link in &links {
                    if link.targets(&old_stem, opts.case_sensitive_target_match) {
                        matching_link_count += 1;
                        link_holding_paths.insert(link.source_path.clone());
                    }
                }
            }

            let mut affected_paths: BTreeSet<PathBuf> = link_holding_paths.clone();
            affected_paths.insert(old_path.clone());

            let mut affected_files = Vec::with_capacity(affected_paths.len());
            for path in &affected_paths {
                let bytes = read_with_retry(path)?;
                affected_files.push(AffectedFile {
                    path: path.clone(),
                    pre_image_sha256: sha256_hex(&bytes),
                    pre_image_bytes_len: bytes.len() as u64,
                });
            }

            let mut rendered = if update_links {
                render(
                    affected_paths.iter().cloned(),
                    &old_stem,
                    &new_stem_clean,
                    opts.case_sensitive_target_match,
                )?
            } else {
                BTreeMap::new()
            };

            // The renamed note's own self-link (if any) rewrites to content
            // that only ever lives at the new path; key it there so prepare
            // stages it as a sibling of `new_path`, not the about-to-vanish
            // `old_path`.
            if let Some(self_render) = rendered.remove(&old_path) {
                rendered.insert(new_path.clone(), self_render);
            }

            Ok((link_holding_paths, matching_link_count, affected_files, rendered))
        };

        let (link_holding_paths, matching_link_count, affected_files, rendered) =
            body().map_err(|cause| EngineError::TransactionPlanFailed {
                correlation_id,
                cause: cause.to_string(),
            })?;

        let manifest = Manifest {
            correlation_id,
            operation: "rename".to_string(),
            old_path,
            new_path,
            update_links,
            affected_files,
        };

        Ok(PlannedTransaction {
            manifest,
            rendered,
            link_holding_paths,
            matching_link_count,
        })
    }

    // ---- phase 2: prepare --------------------------------------------------

    pub(crate) fn prepare(&self, planned: &PlannedTransaction) -> Result<WalEntry> {
        let mut entry = WalEntry::new(planned.manifest.clone());
        entry.phase = Phase::Prepare;

        self.wal.write(&entry).map_err(|_| {
            EngineError::TransactionPrepareFailed(TransactionFailure {
                correlation_id: entry.correlation_id,
                phase: Phase::Plan,
                affected_files: affected_paths(&planned.manifest),
                rolled_back: true,
                wal_path: None,
                recovery_instructions: None,
            })
        })?;

        for (target, rendered) in &planned.rendered {
            let staged = staged_path(target, &entry.correlation_id);

            if write_atomic(&staged, &rendered.bytes).is_err() {
                return Err(EngineError::TransactionPrepareFailed(self.abort(entry)));
            }

            match self.wal.update(entry.correlation_id, |e| {
                e.rendered_files.insert(target.clone(), staged.clone());
            }) {
                Ok(updated) => entry = updated,
                Err(_) => return Err(EngineError::TransactionPrepareFailed(self.abort(entry))),
            }
        }

        Ok(entry)
    }

    // ---- phase 3: validate --------------------------------------------------

    pub(crate) fn validate(
        &self,
        entry: &mut WalEntry,
        planned: &PlannedTransaction,
    ) -> std::result::Result<(), ValidateFailure> {
        match self.wal.update(entry.correlation_id, |e| e.phase = Phase::Validate) {
            Ok(updated) => *entry = updated,
            Err(err) => return Err(ValidateFailure::Io(err)),
        }

        for affected in &planned.manifest.affected_files {
            let current = read_with_retry(&affected.path).map_err(ValidateFailure::Io)?;
            if sha256_hex(&current) != affected.pre_image_sha256 {
                warn!(path = %affected.path.display(), "content changed since plan, aborting");
                return Err(ValidateFailure::Stale(affected.path.clone()));
            }
        }

        Ok(())
    }

    // ---- phase 4: commit -----------------------------------------------------

    pub(crate) fn do_commit(
        &self,
        entry: &mut WalEntry,
        planned: &PlannedTransaction,
    ) -> std::result::Result<(), EngineError> {
        *entry = self.wal.update(entry.correlation_id, |e| e.phase = Phase::Commit)?;

        rename_atomic(&planned.manifest.old_path, &planned.manifest.new_path)?;
        *entry = self.wal.update(entry.correlation_id, |e| {
            e.performed_steps.push(PerformedStep::Rename {
                from: planned.manifest.old_path.clone(),
                to: planned.manifest.new_path.clone(),
            });
        })?;

        let mut staged: Vec<(PathBuf, PathBuf)> = entry
            .rendered_files
            .iter()
            .map(|(target, staged)| (target.clone(), staged.clone()))
            .collect();
        staged.sort_by(|a, b| a.0.cmp(&b.0));

        for (target, staged_file) in staged {
            // Must be a real read, not a defaulted-to-empty best-effort: this
            // is the only copy of `target`'s prior bytes abort/rollback will
            // have if a later step in this same loop fails. Swallowing a read
            // failure here would let rollback "restore" the file to empty
            // instead of leaving it alone.
            let pre_image = std::fs::read(&target)?;
            let new_bytes = std::fs::read(&staged_file)?;
            write_atomic(&target, &new_bytes)?;
            let _ = std::fs::remove_file(&staged_file);

            *entry = self.wal.update(entry.correlation_id, |e| {
                e.performed_steps.push(PerformedStep::Promoted {
                    path: target.clone(),
                    pre_image: pre_image.clone(),
                });
                e.rendered_files.remove(&target);
            })?;
        }

        Ok(())
    }

    // ---- phase 5: success ----------------------------------------------------

    fn succeed(&self, entry: &WalEntry) -> Result<()> {
        self.wal.update(entry.correlation_id, |e| e.phase = Phase::Success)?;
        for staged in entry.rendered_files.values() {
            let _ = std::fs::remove_file(staged);
        }
        self.wal.delete(entry.correlation_id)?;
        Ok(())
    }

    // ---- abort / rollback ----------------------------------------------------

    /// Walks `performed_steps` backwards, sweeps any remaining staged files,
    /// and marks the WAL entry accordingly. Safe to call on an entry that
    /// never got past prepare (`performed_steps` is simply empty).
    pub(crate) fn abort(&self, mut entry: WalEntry) -> TransactionFailure {
        if let Ok(updated) = self.wal.update(entry.correlation_id, |e| e.phase = Phase::Abort) {
            entry = updated;
        } else {
            entry.phase = Phase::Abort;
        }

        let restore_err = restore_from_wal(&entry).err();
        let rolled_back = restore_err.is_none();
        let affected_files = affected_paths(&entry.manifest);

        if rolled_back {
            let _ = self.wal.delete(entry.correlation_id);
            return TransactionFailure {
                correlation_id: entry.correlation_id,
                phase: Phase::Abort,
                affected_files,
                rolled_back: true,
                wal_path: None,
                recovery_instructions: None,
            };
        }

        let cause = restore_err.unwrap_or_default();
        let wal_path = self.wal.dir().join(entry.file_name());
        let instructions = format!(
            "Automatic rollback failed ({cause}). This WAL entry is retained indefinitely; \
             inspect `performed_steps` in {} to restore the affected files by hand, then delete it.",
            wal_path.display()
        );
        let _ = self.wal.update(entry.correlation_id, |e| {
            e.recovery_instructions = Some(instructions.clone());
        });

        TransactionFailure {
            correlation_id: entry.correlation_id,
            phase: Phase::Abort,
            affected_files,
            rolled_back: false,
            wal_path: Some(wal_path),
            recovery_instructions: Some(instructions),
        }
    }
}

fn affected_paths(manifest: &Manifest) -> Vec<PathBuf> {
    manifest.affected_files.iter().map(|f| f.path.clone()).collect()
}

/// Reverses whatever `performed_steps` recorded, then sweeps leftover staged
/// files. Safe to call twice: a second pass finds nothing left to undo and
/// nothing left to sweep.
fn restore_from_wal(entry: &WalEntry) -> std::result::Result<(), String> {
    let mut errors = Vec::new();

    for step in entry.performed_steps.iter().rev() {
        match step {
            PerformedStep::Rename { from, to } => {
                if to.exists() && !from.exists() {
                    if let Err(err) = std::fs::rename(to, from) {
                        errors.push(format!("rename {to:?} back to {from:?} failed: {err}"));
                    }
                }
            }
            PerformedStep::Promoted { path, pre_image } => {
                if let Err(err) = write_atomic(path, pre_image) {
                    errors.push(format!("restore {path:?} failed: {err}"));
                }
            }
        }
    }

    for staged in entry.rendered_files.values() {
        let _ = std::fs::remove_file(staged);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn estimate_time_ms(files_affected: usize) -> (u64, u64) {
    let n = files_affected as u64;
    (5 + 2 * n, 20 + 8 * n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(vault: &Path, state: &Path) -> TransactionManager {
        let wal = WalManager::new(state.to_path_buf()).unwrap();
        TransactionManager::new(vault.to_path_buf(), wal).unwrap()
    }

    #[test]
    fn plain_rename_moves_file_and_rewrites_backlinks() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("N1.md"), "see [[Old]]").unwrap();
        std::fs::write(vault.path().join("N2.md"), "unrelated").unwrap();

        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let outcome = manager.rename(Path::new("Old.md"), "New", true).unwrap();

        assert_eq!(outcome.files_affected, 2);
        assert!(!vault.path().join("Old.md").exists());
        assert!(vault.path().join("New.md").exists());
        let n1 = std::fs::read_to_string(vault.path().join("N1.md")).unwrap();
        assert_eq!(n1, "see [[New]]");
        let n2 = std::fs::read_to_string(vault.path().join("N2.md")).unwrap();
        assert_eq!(n2, "unrelated");
    }

    #[test]
    fn self_link_rewrites_to_the_new_location() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "refers to itself: [[Old]]").unwrap();

        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        manager.rename(Path::new("Old.md"), "New", true).unwrap();

        let content = std::fs::read_to_string(vault.path().join("New.md")).unwrap();
        assert_eq!(content, "refers to itself: [[New]]");
    }

    #[test]
    fn stale_content_aborts_without_mutating_anything() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        let backlink = vault.path().join("N1.md");
        std::fs::write(&backlink, "see [[Old]]").unwrap();

        let state = tempdir().unwrap();

        // Build a manager and drive the protocol by hand so we can mutate the
        // backlink file in between plan and validate, simulating an
        // external edit racing the rename.
        let wal = WalManager::new(state.path().to_path_buf()).unwrap();
        let manager = TransactionManager::new(vault.path().to_path_buf(), wal).unwrap();

        let planned = manager.plan(Path::new("Old.md"), "New", true).unwrap();
        std::fs::write(&backlink, "changed after plan").unwrap();

        let mut entry = manager.prepare(&planned).unwrap();
        let result = manager.validate(&mut entry, &planned);
        assert!(matches!(result, Err(ValidateFailure::Stale(_))));

        let failure = manager.abort(entry);
        assert!(failure.rolled_back);

        assert!(vault.path().join("Old.md").exists());
        assert!(!vault.path().join("New.md").exists());
        assert_eq!(
            std::fs::read_to_string(&backlink).unwrap(),
            "changed after plan"
        );
    }

    #[test]
    fn commit_propagates_pre_image_read_failure_instead_of_defaulting_to_empty() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        let backlink = vault.path().join("N1.md");
        std::fs::write(&backlink, "see [[Old]]").unwrap();

        let state = tempdir().unwrap();
        let wal = WalManager::new(state.path().to_path_buf()).unwrap();
        let manager = TransactionManager::new(vault.path().to_path_buf(), wal).unwrap();

        let planned = manager.plan(Path::new("Old.md"), "New", true).unwrap();
        let mut entry = manager.prepare(&planned).unwrap();
        manager.validate(&mut entry, &planned).unwrap();

        // Simulate the backlink vanishing out from under the transaction
        // between validate and the commit-phase promotion loop (the exact
        // cloud-sync race this engine exists to defend against). Before the
        // fix, `do_commit` would swallow this read failure and record an
        // empty pre-image for the file, so a later rollback would overwrite
        // it with zero bytes instead of leaving it alone.
        std::fs::remove_file(&backlink).unwrap();

        let result = manager.do_commit(&mut entry, &planned);
        assert!(result.is_err(), "expected commit to fail, not silently substitute an empty pre-image");
    }

    #[test]
    fn rename_onto_existing_destination_is_rejected() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("New.md"), "already here").unwrap();

        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let result = manager.rename(Path::new("Old.md"), "New", false);
        assert!(matches!(result, Err(EngineError::FileExists(_))));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("N1.md"), "see [[Old]]").unwrap();

        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let preview = manager.dry_run(Path::new("Old.md"), "New", true).unwrap();

        assert_eq!(preview.files_affected, 2);
        assert_eq!(
            preview.link_updates.as_ref().unwrap().files_with_links,
            1
        );
        assert!(vault.path().join("Old.md").exists());
        assert!(!vault.path().join("New.md").exists());
        assert!(std::fs::read_dir(state.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .all(|e| e.file_name() == "README.txt"));
    }

    #[test]
    fn rollback_by_correlation_id_restores_a_stuck_transaction() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        let backlink = vault.path().join("N1.md");
        std::fs::write(&backlink, "see [[Old]]").unwrap();

        let state = tempdir().unwrap();
        let wal = WalManager::new(state.path().to_path_buf()).unwrap();
        let manager = TransactionManager::new(vault.path().to_path_buf(), wal).unwrap();

        let planned = manager.plan(Path::new("Old.md"), "New", true).unwrap();
        let correlation_id = planned.manifest.correlation_id;
        let mut entry = manager.prepare(&planned).unwrap();
        manager.validate(&mut entry, &planned).unwrap();
        manager.do_commit(&mut entry, &planned).unwrap();
        // Simulate a crash right after commit, before phase 5 ran: the WAL
        // entry is still on disk in phase `commit`.

        let rolled_back = manager.rollback(correlation_id).unwrap();
        assert!(rolled_back);
        assert!(vault.path().join("Old.md").exists());
        assert!(!vault.path().join("New.md").exists());
        assert_eq!(std::fs::read_to_string(&backlink).unwrap(), "see [[Old]]");
    }
}
