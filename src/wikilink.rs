//! The `Wikilink` value object and the single-pass extractor that builds it
//! from raw text.
//!
//! This module only understands text; it has no idea what a vault or a
//! transaction is. `scanner.rs` drives it across files.

use std::path::{Path, PathBuf};

use regex::Captures;

use crate::paths::WIKILINK_RE;

/// A wikilink's anchor, if any. Heading and block-reference anchors are
/// mutually exclusive; the block form keeps its `^` sigil in the stored
/// value so reconstruction is byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Anchor {
    None,
    Heading(String),
    Block(String),
}

/// One occurrence of `[[...]]` (or `![[...]]`) syntax in a note.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Wikilink {
    pub source_path: PathBuf,
    pub line: usize,
    pub col_start: usize,
    pub col_end: usize,
    pub is_embed: bool,
    pub target: String,
    pub anchor: Anchor,
    pub alias: Option<String>,
    pub in_frontmatter: bool,
}

impl Wikilink {
    /// Rebuilds the original `[[...]]` text from the parsed components.
    /// Required to be exact for every valid input (§8 property 6).
    pub fn reconstruct(&self) -> String {
        let embed = if self.is_embed { "!" } else { "" };
        let anchor = match &self.anchor {
            Anchor::None => String::new(),
            Anchor::Heading(text) => format!("#{text}"),
            Anchor::Block(id) => format!("#{id}"),
        };
        let alias = self
            .alias
            .as_ref()
            .map(|a| format!("|{a}"))
            .unwrap_or_default();
        format!("{embed}[[{}{anchor}{alias}]]", self.target)
    }

    /// True if this link's target, case-folded, matches `stem`.
    pub fn targets(&self, stem: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            self.target == stem
        } else {
            self.target.eq_ignore_ascii_case(stem)
        }
    }
}

fn offset_to_line(content: &str, byte_offset: usize) -> usize {
    let mut line = 1;
    for (idx, ch) in content.char_indices() {
        if idx >= byte_offset {
            break;
        }
        if ch == '\n' {
            line += 1;
        }
    }
    line
}

fn build_anchor(raw: Option<&str>) -> Anchor {
    match raw {
        None => Anchor::None,
        Some(text) if text.starts_with('^') => Anchor::Block(text.to_string()),
        Some(text) => Anchor::Heading(text.to_string()),
    }
}

/// Extracts every wikilink in `content`, tagging each with `source_path` and
/// `in_frontmatter`. Byte offsets are absolute within `content`; callers
/// scanning a sub-slice (e.g. just the frontmatter header) must add their
/// own base offset.
pub fn extract_wikilinks(
    content: &str,
    source_path: &Path,
    in_frontmatter: bool,
) -> Vec<Wikilink> {
    WIKILINK_RE
        .captures_iter(content)
        .map(|caps: Captures| {
            let full = caps.get(0).unwrap();
            Wikilink {
                source_path: source_path.to_path_buf(),
                line: offset_to_line(content, full.start()),
                col_start: full.start(),
                col_end: full.end(),
                is_embed: caps.get(1).is_some(),
                target: caps.get(2).unwrap().as_str().to_string(),
                anchor: build_anchor(caps.get(3).map(|m| m.as_str())),
                alias: caps.get(4).map(|m| m.as_str().to_string()),
                in_frontmatter,
            }
        })
        .collect()
}
