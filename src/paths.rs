//! Path normalization and wikilink-pattern primitives shared by every other
//! module in the engine.
//!
//! Nothing here touches the WAL or the transaction protocol: this module is
//! pure path arithmetic and a single stateless regex.

use std::path::{Path, PathBuf};

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{EngineError, Result};

/// The bit-exact wikilink grammar. Capture groups, in order:
/// 1. embed marker `!` (absent if not an embed)
/// 2. target stem (required)
/// 3. anchor text, including a leading `^` when it is a block reference
/// 4. alias display text
pub static WIKILINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!)?\[\[(.+?)(?:#(\^[^\]|]+|[^\]|]+))?(?:\|(.+?))?\]\]")
        .expect("wikilink pattern is a fixed, valid regex")
});

/// Escapes `s` for literal use inside a regex alternation, e.g. when building
/// a pattern that must match one specific note's stem.
pub fn regex_escape(s: &str) -> String {
    regex::escape(s)
}

/// Returns true if `path`'s extension case-insensitively matches `md`.
pub fn is_markdown_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

/// The filename stem (no extension), as a plain `String`. Empty if the path
/// has none.
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

/// Appends the `.md` extension to a bare stem, producing a sibling path in
/// the same directory as `reference`.
pub fn with_markdown_extension(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.md"))
}

/// Normalizes `input` to an absolute path and verifies it falls under
/// `vault_root`, without requiring `input` to already exist (the destination
/// of a rename never does at plan time).
///
/// Strategy: canonicalize the longest existing ancestor, then rejoin the
/// remaining (not-yet-existing) components literally. This keeps
/// normalization idempotent for paths that do exist while still rejecting
/// `..`-based escapes for paths that don't.
pub fn normalize_in_vault(vault_root: &Path, input: &Path) -> Result<PathBuf> {
    let vault_root = vault_root.canonicalize().map_err(|err| {
        canonicalize_error(err, vault_root)
    })?;

    let joined = if input.is_absolute() {
        input.to_path_buf()
    } else {
        vault_root.join(input)
    };

    let (existing_ancestor, remainder) = longest_existing_ancestor(&joined);
    let canonical_ancestor = existing_ancestor
        .canonicalize()
        .map_err(|err| canonicalize_error(err, input))?;

    let mut normalized = canonical_ancestor;
    for component in remainder {
        normalized.push(component);
    }

    if !normalized.starts_with(&vault_root) {
        return Err(EngineError::InvalidPath(input.to_path_buf()));
    }

    Ok(normalized)
}

/// A failed ancestor lookup is `PermissionDenied` if the OS refused access
/// and `InvalidPath` for everything else (missing component, not-a-directory,
/// and so on) — the two §7 error kinds that a canonicalize failure can mean.
fn canonicalize_error(err: std::io::Error, path: &Path) -> EngineError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        EngineError::PermissionDenied(path.to_path_buf())
    } else {
        EngineError::InvalidPath(path.to_path_buf())
    }
}

/// Byte ranges covered by fenced code blocks (``` or ~~~) in `content`.
/// Shared by the scanner (to exclude wikilink-looking text inside example
/// code from its results) and the rewriter (to leave such text untouched
/// when rewriting matching links).
pub fn code_block_spans(content: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut in_block = false;
    let mut block_start = 0usize;
    let mut pos = 0usize;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            if in_block {
                spans.push((block_start, pos + line.len()));
                in_block = false;
            } else {
                in_block = true;
                block_start = pos;
            }
        }
        pos += line.len();
    }
    if in_block {
        spans.push((block_start, content.len()));
    }
    spans
}

/// True if `offset` falls inside any of `spans`.
pub fn in_any_span(spans: &[(usize, usize)], offset: usize) -> bool {
    spans.iter().any(|&(start, end)| offset >= start && offset < end)
}

/// Splits `path` into the longest prefix that exists on disk and the
/// remaining trailing components that do not.
fn longest_existing_ancestor(path: &Path) -> (PathBuf, Vec<std::ffi::OsString>) {
    let mut remainder = Vec::new();
    let mut current = path.to_path_buf();

    while !current.exists() {
        match current.file_name() {
            Some(name) => {
                remainder.push(name.to_os_string());
                current.pop();
            }
            None => break,
        }
    }

    remainder.reverse();
    (current, remainder)
}
