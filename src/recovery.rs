//! Boot recovery.
//!
//! Runs once, before the front door starts accepting `rename` calls: scans
//! the WAL for entries nobody finished, and rolls each one back. A WAL entry
//! only survives a clean shutdown if the process crashed mid-transaction, so
//! anything `scan_pending` returns here is, by construction, abandoned.

use chrono::Duration;
use tracing::{error, info, warn};

use crate::transaction::TransactionManager;

/// The age filter applied to `scan_pending`: entries younger than this are
/// assumed to belong to a transaction that is still legitimately in flight
/// (e.g. a concurrent process that just entered `prepare`), not an orphan.
pub const MIN_AGE: Duration = Duration::minutes(1);

/// Outcome of rolling back one orphaned entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Rollback restored every file; the WAL entry is gone.
    Success,
    /// Rollback could not restore everything; the WAL entry is retained with
    /// `phase=abort` and a recovery-instructions field.
    Partial,
    /// The entry could not even be read cleanly (shouldn't happen —
    /// `scan_pending` itself skips corrupt files — but handled defensively).
    Failure,
}

/// A single entry's recovery result, reported back to the caller so it can
/// log or surface recovery status however it likes.
#[derive(Debug)]
pub struct RecoveryReport {
    pub correlation_id: uuid::Uuid,
    pub outcome: RecoveryOutcome,
}

/// Runs boot recovery once: finds every orphaned WAL entry older than
/// [`MIN_AGE`] and rolls each back. Never returns an error itself — a
/// single entry's rollback failure is reported, not propagated, because
/// recovery must never block the process from serving requests (§4.7).
pub fn run(manager: &TransactionManager) -> Vec<RecoveryReport> {
    let pending = match manager.wal().scan_pending(MIN_AGE) {
        Ok(pending) => pending,
        Err(err) => {
            error!(error = %err, "boot recovery could not scan the WAL directory");
            return Vec::new();
        }
    };

    if pending.is_empty() {
        info!("boot recovery found no orphaned transactions");
        return Vec::new();
    }

    info!(count = pending.len(), "boot recovery rolling back orphaned transactions");

    let mut reports = Vec::with_capacity(pending.len());
    for entry in pending {
        let correlation_id = entry.correlation_id;
        let outcome = match manager.rollback(correlation_id) {
            Ok(true) => {
                info!(%correlation_id, "orphaned transaction rolled back");
                RecoveryOutcome::Success
            }
            Ok(false) => {
                warn!(%correlation_id, "orphaned transaction rollback left WAL entry for manual recovery");
                RecoveryOutcome::Partial
            }
            Err(err) => {
                error!(%correlation_id, error = %err, "failed to roll back orphaned transaction");
                RecoveryOutcome::Failure
            }
        };
        reports.push(RecoveryReport { correlation_id, outcome });
    }

    reports
}
