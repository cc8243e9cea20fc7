//! Atomic file writer.
//!
//! The one rule every other module relies on: `write_atomic` either leaves
//! `path` with the new bytes, or leaves it completely untouched. No partial
//! writes are ever observable, because the write lands in a temp file in the
//! same directory and is promoted onto the destination with a single
//! filesystem rename.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{instrument, warn};

use crate::error::{EngineError, Result};

/// Bounded retry budget for transient errors (cloud-sync contention, mostly).
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);

/// Renames the vault-facing `Writer` into a pure free-function atomic write
/// plus the bounded-retry loop the spec requires; there is no per-call state
/// worth wrapping in a struct.
#[instrument(skip(bytes), fields(path = %path.display()))]
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent_dir = existing_parent_or_bad_path(path)?;

    let mut attempt = 0u32;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        attempt += 1;
        match try_write_once(parent_dir, path, bytes) {
            Ok(()) => return Ok(()),
            Err(err) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                warn!(
                    attempt,
                    max = MAX_ATTEMPTS,
                    error = %err,
                    "transient write error, retrying"
                );
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(err) if is_transient(&err) => {
                warn!(attempts = attempt, "write retries exhausted");
                return Err(EngineError::WriteTransient(attempt));
            }
            Err(err) => return Err(EngineError::WriteFatal(err)),
        }
    }
}

/// Renames `old` to `new`, both expected to already live under the vault
/// root. Not retried: a bad rename target is a program error, not a
/// transient filesystem hiccup, and the transaction manager is the one
/// deciding whether to retry a whole commit step.
#[instrument(fields(old = %old.display(), new = %new.display()))]
pub fn rename_atomic(old: &Path, new: &Path) -> Result<()> {
    std::fs::rename(old, new).map_err(EngineError::Io)
}

/// Resolves `path`'s parent directory and confirms it actually exists on
/// disk before the retry loop ever starts. A missing directory is checked
/// here, up front, rather than left to surface as a `NotFound` out of
/// `NamedTempFile::new_in` — that `NotFound` is reserved for the genuinely
/// transient case of a directory vanishing mid-operation (§4.2), and
/// classifying a directory that was never there the same way would mean
/// five retries and ~300ms of backoff before reporting the wrong error kind.
fn existing_parent_or_bad_path(path: &Path) -> Result<&Path> {
    let parent = path.parent().ok_or_else(|| {
        EngineError::WriteBadPath(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        ))
    })?;

    if !parent.is_dir() {
        return Err(EngineError::WriteBadPath(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("directory does not exist: {}", parent.display()),
        )));
    }

    Ok(parent)
}

fn try_write_once(parent_dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp_file = NamedTempFile::new_in(parent_dir)?;
    temp_file.write_all(bytes)?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// The transient-error whitelist named in §4.2: resource-busy, permission
/// hiccups (common under cloud-sync file locks), and a mid-operation
/// not-found (the directory vanished and reappeared under us).
fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        WouldBlock | PermissionDenied | NotFound | Interrupted | TimedOut
    )
}

/// A plain, unretried read, sharing the same transient-error classification
/// contract described for writes in §6.3 ("read-with-retry"). The scanner
/// calls this rather than `std::fs::read` directly so the retry policy stays
/// in one place.
#[instrument(fields(path = %path.display()))]
pub fn read_with_retry(path: &Path) -> Result<Vec<u8>> {
    let mut attempt = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        attempt += 1;
        match std::fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            Err(err) if is_transient(&err) && attempt < MAX_ATTEMPTS => {
                warn!(attempt, error = %err, "transient read error, retrying");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(err) if is_transient(&err) => {
                return Err(EngineError::WriteTransient(attempt));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::FileNotFound(path.to_path_buf()));
            }
            Err(err) => return Err(EngineError::WriteFatal(err)),
        }
    }
}

/// Staged temp files: siblings of the real file, named so boot recovery can
/// recognize and sweep orphans by correlation id.
pub fn staged_path(target: &Path, correlation_id: &uuid::Uuid) -> PathBuf {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let basename = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".stage-{correlation_id}-{basename}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_file_with_exact_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.md");

        write_atomic(&path, b"hello").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.md");

        write_atomic(&path, b"hello").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty(), "expected no stray temp files");
    }

    #[test]
    fn write_atomic_overwrites_existing_content_fully() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.md");
        std::fs::write(&path, b"old content that is longer").unwrap();

        write_atomic(&path, b"new").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn write_atomic_bad_path_reports_bad_path_immediately() {
        let path = Path::new("/nonexistent-dir-xyz/A.md");
        let result = write_atomic(path, b"hello");
        assert!(
            matches!(result, Err(EngineError::WriteBadPath(_))),
            "expected WriteBadPath, got {result:?}"
        );
    }

    #[test]
    fn staged_path_is_a_sibling_with_correlation_id() {
        let target = Path::new("/vault/A.md");
        let id = uuid::Uuid::nil();
        let staged = staged_path(target, &id);
        assert_eq!(staged.parent(), Some(Path::new("/vault")));
        assert!(staged
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(&id.to_string()));
    }
}
