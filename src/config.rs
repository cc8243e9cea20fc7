//! Process configuration and state-directory resolution.
//!
//! Two directories matter to this engine and they are resolved completely
//! differently: the vault root is supplied explicitly by the caller (never
//! discovered), while the WAL/state directory is resolved XDG-style via
//! `directories::ProjectDirs`, since WAL entries are runtime recovery data,
//! not user configuration, and must live outside whatever directory a cloud
//! sync client might be watching.

use std::path::PathBuf;

use crate::error::{EngineError, Result};

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "vault-engine";
const APPLICATION: &str = "vault-engine";

/// Resolved directories for a single engine invocation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub vault_root: PathBuf,
    pub state_dir: PathBuf,
}

impl EngineConfig {
    /// Builds a config from an explicit vault root, resolving the state
    /// directory via the platform's XDG-style convention
    /// (`~/.local/state/<qualifier>/<app>` on Linux).
    pub fn new(vault_root: PathBuf) -> Result<Self> {
        let state_dir = default_state_dir()?;
        Ok(Self { vault_root, state_dir })
    }

    /// As `new`, but with an explicit state directory override — used by
    /// tests and by callers who want the WAL somewhere other than the
    /// platform default.
    pub fn with_state_dir(vault_root: PathBuf, state_dir: PathBuf) -> Self {
        Self { vault_root, state_dir }
    }
}

/// The default state directory: `ProjectDirs::state_dir()`, falling back to
/// `data_local_dir()/state` on platforms (e.g. macOS) where `directories`
/// does not expose a dedicated state directory.
fn default_state_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or(EngineError::NoStateDir)?;

    let dir = dirs
        .state_dir()
        .map(PathBuf::from)
        .unwrap_or_else(|| dirs.data_local_dir().join("state"));

    Ok(dir.join("wal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_state_dir_is_used_verbatim() {
        let config = EngineConfig::with_state_dir(
            PathBuf::from("/vault"),
            PathBuf::from("/tmp/some-state-dir"),
        );
        assert_eq!(config.vault_root, PathBuf::from("/vault"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/some-state-dir"));
    }

    #[test]
    fn default_state_dir_resolves_without_error() {
        // Exercises the real `directories` resolution path; doesn't assert an
        // exact value since that's platform-dependent.
        assert!(default_state_dir().is_ok());
    }
}
