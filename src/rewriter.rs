//! Two-phase link rewriter.
//!
//! `render` computes new file bytes without touching disk; `commit` writes a
//! previously rendered map through the atomic writer. Keeping these separate
//! is what lets the transaction manager stage everything in phase 2 and only
//! commit in phase 4, after validation has already passed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Captures;

use crate::error::{EngineError, Result};
use crate::hash::sha256_hex;
use crate::paths::{code_block_spans, in_any_span, WIKILINK_RE};
use crate::writer::write_atomic;

#[derive(Debug, Clone)]
pub struct RenderedFile {
    pub bytes: Vec<u8>,
    pub post_image_sha256: String,
}

/// Outcome of `commit`: everything written so far, and the first failure (if
/// any) that stopped iteration.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub written: Vec<PathBuf>,
    pub failed: Option<(PathBuf, EngineError)>,
}

/// Pure planning pass: reads each affected path, rewrites every link whose
/// target (case-folded per `case_sensitive`) matches `old_stem`, and returns
/// the resulting bytes keyed by path in lexicographic order. Never writes.
pub fn render(
    affected_paths: impl IntoIterator<Item = PathBuf>,
    old_stem: &str,
    new_stem: &str,
    case_sensitive: bool,
) -> Result<BTreeMap<PathBuf, RenderedFile>> {
    let mut rendered = BTreeMap::new();

    for path in affected_paths {
        let content = read_for_render(&path)?;
        let new_content = rewrite_content(&content, old_stem, new_stem, case_sensitive);

        if new_content != content {
            let bytes = new_content.into_bytes();
            let post_image_sha256 = sha256_hex(&bytes);
            rendered.insert(path, RenderedFile { bytes, post_image_sha256 });
        }
    }

    Ok(rendered)
}

/// Writes a previously rendered map in deterministic (lexicographic, via
/// `BTreeMap`) order. Stops at the first failure rather than pressing on —
/// a partially-committed rewrite is exactly what the transaction manager's
/// rollback exists to prevent from becoming visible.
pub fn commit(rendered: &BTreeMap<PathBuf, RenderedFile>) -> CommitReport {
    let mut report = CommitReport::default();
    for (path, file) in rendered {
        match write_atomic(path, &file.bytes) {
            Ok(()) => report.written.push(path.clone()),
            Err(err) => {
                report.failed = Some((path.clone(), err));
                break;
            }
        }
    }
    report
}

/// Legacy convenience for non-transactional callers: scans the vault itself,
/// renders, and commits in one call. Not used by the rename engine, which
/// always goes through the transaction manager instead.
pub fn direct(vault_root: &Path, old_stem: &str, new_stem: &str) -> Result<Vec<PathBuf>> {
    use crate::scanner::{scan_vault, ScanOptions};

    let opts = ScanOptions::default();
    let links = scan_vault(vault_root, &opts)?;
    let affected: std::collections::BTreeSet<PathBuf> = links
        .iter()
        .filter(|link| link.targets(old_stem, opts.case_sensitive_target_match))
        .map(|link| link.source_path.clone())
        .collect();

    let rendered = render(affected, old_stem, new_stem, opts.case_sensitive_target_match)?;
    let report = commit(&rendered);

    match report.failed {
        Some((_, err)) => Err(err),
        None => Ok(report.written),
    }
}

fn read_for_render(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|cause| EngineError::RenderIo {
        path: path.to_path_buf(),
        cause,
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Rewrites every `[[old_stem...]]` occurrence in `content`, preserving embed
/// marker, anchor (including the block `^` sigil), and alias byte-for-byte.
/// Matches inside fenced code blocks are left untouched even when their
/// target matches; matches inside frontmatter are rewritten like any other
/// (the scanner's `include_frontmatter` gate only affects what counts as an
/// *affected* file, not what the rewriter does once a file is selected).
fn rewrite_content(content: &str, old_stem: &str, new_stem: &str, case_sensitive: bool) -> String {
    let code_spans = code_block_spans(content);

    WIKILINK_RE
        .replace_all(content, |caps: &Captures| {
            let full = caps.get(0).unwrap();
            if in_any_span(&code_spans, full.start()) {
                return full.as_str().to_string();
            }

            let target = caps.get(2).unwrap().as_str();
            let matches = if case_sensitive {
                target == old_stem
            } else {
                target.eq_ignore_ascii_case(old_stem)
            };

            if !matches {
                return full.as_str().to_string();
            }

            let embed = caps.get(1).map_or("", |m| m.as_str());
            let anchor = caps
                .get(3)
                .map(|m| format!("#{}", m.as_str()))
                .unwrap_or_default();
            let alias = caps
                .get(4)
                .map(|m| format!("|{}", m.as_str()))
                .unwrap_or_default();
            format!("{embed}[[{new_stem}{anchor}{alias}]]")
        })
        .into_owned()
}
