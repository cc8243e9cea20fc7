//! Rename front door (C8).
//!
//! The only entry point the RPC shell (or, in this repo, the CLI) ever
//! calls. Validates the bare inputs that don't need a transaction to reject
//! (an empty new name, say), delegates everything else to
//! [`TransactionManager`], and reshapes its outcome into the result/error
//! taxonomy of §4.8/§7. Nothing downstream of this module knows it's being
//! driven by an RPC shell at all.

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::transaction::{DryRunPreview, TransactionManager};
use crate::wal::Phase;

/// Options accepted alongside `old`/`new_filename`, mirroring §4.8 exactly.
#[derive(Debug, Clone)]
pub struct RenameOptions {
    pub update_links: bool,
    pub dry_run: bool,
}

impl Default for RenameOptions {
    fn default() -> Self {
        Self { update_links: true, dry_run: false }
    }
}

/// The conceptual error kind taken on by a failed `rename` call, independent
/// of the `EngineError` variant that produced it — this is the vocabulary
/// the RPC shell is expected to render verbatim to the AI client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    FileNotFound,
    FileExists,
    InvalidPath,
    PermissionDenied,
    TransactionPlanFailed,
    TransactionPrepareFailed,
    TransactionValidateFailed,
    TransactionCommitFailed,
    TransactionRollbackFailed,
    TransactionStaleContent,
    TransactionFailed,
}

/// Every error surface carries this: correlation ID (if one was assigned),
/// the failing phase, affected files, rollback status, and — when
/// rollback itself failed — the WAL path and recovery instructions.
#[derive(Debug, Clone, Serialize)]
pub struct RenameError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Option<Uuid>,
    pub phase: Option<Phase>,
    pub affected_files: Vec<PathBuf>,
    pub rolled_back: Option<bool>,
    pub wal_path: Option<PathBuf>,
    pub recovery_instructions: Option<String>,
}

impl std::fmt::Display for RenameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RenameError {}

/// Timing for one phase, in milliseconds, surfaced on success.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenameSuccess {
    pub success: bool,
    pub correlation_id: Uuid,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub files_affected: usize,
    pub phase_timings_ms: Vec<PhaseTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkUpdatesPreview {
    pub files_with_links: usize,
    pub affected_paths: Vec<PathBuf>,
    pub total_references: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimatedTimeMs {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenamePreview {
    pub operation: &'static str,
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub will_update_links: bool,
    pub files_affected: usize,
    pub link_updates: Option<LinkUpdatesPreview>,
    pub transaction_phases: Vec<&'static str>,
    pub estimated_time_ms: EstimatedTimeMs,
}

/// Either a completed rename or a dry-run preview — the RPC shell renders
/// whichever one it gets.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RenameResult {
    Success(RenameSuccess),
    Preview(RenamePreview),
}

/// Validates `old`/`new_filename` and invokes the transaction manager,
/// shaping whatever comes back into [`RenameResult`] or [`RenameError`].
///
/// `old` may be a bare stem or a path with extension; both resolve through
/// C1 inside the transaction manager. `new_filename` must not be empty —
/// that's the one check cheap enough to do before touching the manager.
pub fn rename(
    manager: &TransactionManager,
    old: &Path,
    new_filename: &str,
    options: RenameOptions,
) -> std::result::Result<RenameResult, RenameError> {
    let new_stem = new_filename.trim();
    if new_stem.is_empty() {
        return Err(RenameError {
            kind: ErrorKind::InvalidPath,
            message: "new filename must not be empty".to_string(),
            correlation_id: None,
            phase: None,
            affected_files: Vec::new(),
            rolled_back: None,
            wal_path: None,
            recovery_instructions: None,
        });
    }

    if options.dry_run {
        let preview = manager
            .dry_run(old, new_stem, options.update_links)
            .map_err(|err| shape_error(err))?;
        return Ok(RenameResult::Preview(shape_preview(preview)));
    }

    let outcome = manager
        .rename(old, new_stem, options.update_links)
        .map_err(shape_error)?;

    Ok(RenameResult::Success(RenameSuccess {
        success: true,
        correlation_id: outcome.correlation_id,
        old_path: outcome.old_path,
        new_path: outcome.new_path,
        files_affected: outcome.files_affected,
        phase_timings_ms: {
            let mut order = vec!["plan", "prepare", "validate", "commit", "success"];
            order.retain(|p| outcome.phase_timings_ms.contains_key(*p));
            order
                .into_iter()
                .map(|phase| PhaseTiming {
                    phase: phase.to_string(),
                    ms: outcome.phase_timings_ms[phase],
                })
                .collect()
        },
    }))
}

fn shape_preview(preview: DryRunPreview) -> RenamePreview {
    RenamePreview {
        operation: preview.operation,
        old_path: preview.old_path,
        new_path: preview.new_path,
        will_update_links: preview.will_update_links,
        files_affected: preview.files_affected,
        link_updates: preview.link_updates.map(|lu| LinkUpdatesPreview {
            files_with_links: lu.files_with_links,
            affected_paths: lu.affected_paths,
            total_references: lu.total_references,
        }),
        transaction_phases: preview.transaction_phases,
        estimated_time_ms: EstimatedTimeMs {
            min: preview.estimated_time_ms.0,
            max: preview.estimated_time_ms.1,
        },
    }
}

fn shape_error(err: EngineError) -> RenameError {
    let base = |kind: ErrorKind, message: String| RenameError {
        kind,
        message,
        correlation_id: None,
        phase: None,
        affected_files: Vec::new(),
        rolled_back: None,
        wal_path: None,
        recovery_instructions: None,
    };

    match &err {
        EngineError::InvalidPath(_) => base(ErrorKind::InvalidPath, err.to_string()),
        EngineError::FileNotFound(_) => base(ErrorKind::FileNotFound, err.to_string()),
        EngineError::FileExists(_) => base(ErrorKind::FileExists, err.to_string()),
        EngineError::PermissionDenied(_) => base(ErrorKind::PermissionDenied, err.to_string()),
        EngineError::TransactionPlanFailed { correlation_id, .. } => RenameError {
            correlation_id: Some(*correlation_id),
            phase: Some(Phase::Plan),
            ..base(ErrorKind::TransactionPlanFailed, err.to_string())
        },
        EngineError::TransactionPrepareFailed(failure) => {
            from_transaction_failure(ErrorKind::TransactionPrepareFailed, &err, failure)
        }
        EngineError::TransactionStaleContent(failure, path) => {
            let mut shaped =
                from_transaction_failure(ErrorKind::TransactionStaleContent, &err, failure);
            if !shaped.affected_files.contains(path) {
                shaped.affected_files.push(path.clone());
            }
            shaped
        }
        EngineError::TransactionValidateFailed(failure) => {
            from_transaction_failure(ErrorKind::TransactionValidateFailed, &err, failure)
        }
        EngineError::TransactionCommitFailed(failure) => {
            from_transaction_failure(ErrorKind::TransactionCommitFailed, &err, failure)
        }
        EngineError::Io(io_err) | EngineError::WriteFatal(io_err)
            if io_err.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            base(ErrorKind::PermissionDenied, err.to_string())
        }
        _ => base(ErrorKind::TransactionFailed, err.to_string()),
    }
}

/// Shapes a phase-tagged transactional failure into a `RenameError`.
///
/// When `failure.rolled_back` is false, automatic rollback itself did not
/// fully restore the vault — per §7 that supersedes whichever phase
/// originally failed, so the kind reported to the caller becomes
/// `TransactionRollbackFailed` rather than the phase-specific kind passed in.
/// This is the only place `ErrorKind::TransactionRollbackFailed` is produced.
fn from_transaction_failure(
    kind: ErrorKind,
    err: &EngineError,
    failure: &crate::error::TransactionFailure,
) -> RenameError {
    let kind = if failure.rolled_back {
        kind
    } else {
        ErrorKind::TransactionRollbackFailed
    };

    RenameError {
        kind,
        message: err.to_string(),
        correlation_id: Some(failure.correlation_id),
        phase: Some(failure.phase),
        affected_files: failure.affected_files.clone(),
        rolled_back: Some(failure.rolled_back),
        wal_path: failure.wal_path.clone(),
        recovery_instructions: failure.recovery_instructions.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalManager;
    use tempfile::tempdir;

    fn manager(vault: &Path, state: &Path) -> TransactionManager {
        let wal = WalManager::new(state.to_path_buf()).unwrap();
        TransactionManager::new(vault.to_path_buf(), wal).unwrap()
    }

    #[test]
    fn successful_rename_reports_files_affected_and_timings() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("N1.md"), "[[Old]]").unwrap();
        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let result = rename(
            &manager,
            Path::new("Old.md"),
            "New",
            RenameOptions::default(),
        )
        .unwrap();

        match result {
            RenameResult::Success(success) => {
                assert!(success.success);
                assert_eq!(success.files_affected, 2);
                assert_eq!(success.phase_timings_ms.len(), 5);
            }
            RenameResult::Preview(_) => panic!("expected a success result"),
        }
    }

    #[test]
    fn dry_run_returns_preview_without_mutating() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("N1.md"), "[[Old]]").unwrap();
        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let result = rename(
            &manager,
            Path::new("Old.md"),
            "New",
            RenameOptions { update_links: true, dry_run: true },
        )
        .unwrap();

        match result {
            RenameResult::Preview(preview) => {
                assert_eq!(preview.files_affected, 2);
                assert!(preview.estimated_time_ms.min <= preview.estimated_time_ms.max);
            }
            RenameResult::Success(_) => panic!("expected a preview result"),
        }
        assert!(vault.path().join("Old.md").exists());
    }

    #[test]
    fn empty_new_filename_is_rejected_before_touching_the_manager() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let err = rename(&manager, Path::new("Old.md"), "   ", RenameOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPath);
        assert!(manager.wal().scan_pending(chrono::Duration::zero()).unwrap().is_empty());
    }

    #[test]
    fn destination_exists_maps_to_file_exists_kind() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        std::fs::write(vault.path().join("New.md"), "already here").unwrap();
        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        let err = rename(&manager, Path::new("Old.md"), "New", RenameOptions::default())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileExists);
        assert!(err.correlation_id.is_none());
    }

    #[test]
    fn stale_content_maps_to_stale_content_kind_with_affected_file() {
        let vault = tempdir().unwrap();
        std::fs::write(vault.path().join("Old.md"), "hello").unwrap();
        let backlink = vault.path().join("N1.md");
        std::fs::write(&backlink, "[[Old]]").unwrap();
        let state = tempdir().unwrap();
        let manager = manager(vault.path(), state.path());

        // Plan sees the original content, then an external writer (standing
        // in for a cloud-sync agent) mutates the backlink before validate
        // runs. This drives the same plan→prepare→validate path `rename`
        // uses internally and confirms the shaped error this module would
        // hand back to the front door's caller.
        let planned = manager.plan(Path::new("Old.md"), "New", true).unwrap();
        std::fs::write(&backlink, "[[Old]] changed").unwrap();
        let mut entry = manager.prepare(&planned).unwrap();
        let validated = manager.validate(&mut entry, &planned);
        assert!(validated.is_err());
        let failure = manager.abort(entry);

        let shaped = from_transaction_failure(
            ErrorKind::TransactionStaleContent,
            &EngineError::TransactionStaleContent(failure.clone(), backlink.clone()),
            &failure,
        );
        assert_eq!(shaped.kind, ErrorKind::TransactionStaleContent);
        assert!(shaped.rolled_back.unwrap());
        assert!(shaped.affected_files.contains(&backlink));
    }

    #[test]
    fn failed_rollback_overrides_the_phase_specific_kind() {
        let failure = crate::error::TransactionFailure {
            correlation_id: Uuid::new_v4(),
            phase: Phase::Abort,
            affected_files: vec![PathBuf::from("N1.md")],
            rolled_back: false,
            wal_path: Some(PathBuf::from("/state/wal/entry.json")),
            recovery_instructions: Some("inspect performed_steps".to_string()),
        };
        let err = EngineError::TransactionCommitFailed(failure.clone());

        let shaped = from_transaction_failure(ErrorKind::TransactionCommitFailed, &err, &failure);

        assert_eq!(shaped.kind, ErrorKind::TransactionRollbackFailed);
        assert_eq!(shaped.rolled_back, Some(false));
        assert!(shaped.wal_path.is_some());
    }
}
