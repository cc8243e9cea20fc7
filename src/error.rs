//! Unified error handling.
//!
//! Contains all application error variants, including the structured
//! transactional errors the rename engine surfaces to its caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::wal::Phase;

/// Everything a transactional failure needs to carry so a caller can decide
/// whether and how to retry: which transaction, which phase it died in, which
/// files were touched, and whether rollback actually succeeded.
///
/// There is no separate `EngineError` variant for "rollback itself failed" —
/// every phase failure already carries one of these, and `rolled_back` is
/// where that outcome lives. `rename.rs::shape_error` reads this field to
/// surface the distinct `TransactionRollbackFailed` kind to callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransactionFailure {
    pub correlation_id: uuid::Uuid,
    pub phase: Phase,
    pub affected_files: Vec<PathBuf>,
    pub rolled_back: bool,
    pub wal_path: Option<PathBuf>,
    pub recovery_instructions: Option<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Path '{0:?}' could not be normalized under the vault root")]
    InvalidPath(PathBuf),

    #[error("could not resolve a state directory for this platform")]
    NoStateDir,

    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    #[error("File already exists: {0:?}")]
    FileExists(PathBuf),

    #[error("Permission denied: {0:?}")]
    PermissionDenied(PathBuf),

    #[error("Write failed after {0} transient retries")]
    WriteTransient(u32),

    #[error("Write failed fatally: {0}")]
    WriteFatal(std::io::Error),

    #[error("Write target directory does not exist: {0}")]
    WriteBadPath(std::io::Error),

    #[error("Reading source file for rewrite failed: {path:?}: {cause}")]
    RenderIo {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("Unknown WAL schema version {found}, expected {expected}")]
    WalSchemaMismatch { found: u32, expected: u32 },

    #[error("WAL entry {0} is corrupt: correlation id in filename and payload disagree")]
    WalCorrupt(String),

    #[error("Transaction {correlation_id} failed during plan: {cause}")]
    TransactionPlanFailed {
        correlation_id: uuid::Uuid,
        cause: String,
    },

    #[error("Transaction {} failed during prepare", .0.correlation_id)]
    TransactionPrepareFailed(TransactionFailure),

    #[error("Transaction {} detected stale content: {1:?}", .0.correlation_id)]
    TransactionStaleContent(TransactionFailure, PathBuf),

    #[error("Transaction {} failed during validate", .0.correlation_id)]
    TransactionValidateFailed(TransactionFailure),

    #[error("Transaction {} failed during commit", .0.correlation_id)]
    TransactionCommitFailed(TransactionFailure),
}

impl EngineError {
    /// The transactional failure payload, if this error carries one.
    pub fn transaction_failure(&self) -> Option<&TransactionFailure> {
        match self {
            EngineError::TransactionPrepareFailed(f)
            | EngineError::TransactionStaleContent(f, _)
            | EngineError::TransactionValidateFailed(f)
            | EngineError::TransactionCommitFailed(f) => Some(f),
            _ => None,
        }
    }
}

// Mirrors the cross-boundary pattern of rendering errors as their Display
// string, so a CLI (standing in for the RPC shell) can render them verbatim.
impl serde::Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
