//! Vault-wide wikilink enumeration.
//!
//! Walks every markdown note under the vault root and extracts its
//! wikilinks, honoring the frontmatter/code-block/embed rules from §4.3.
//! Restartable and stateless: nothing here is cached across calls.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::Result;
use crate::paths::{code_block_spans, in_any_span, is_markdown_file};
use crate::wikilink::{extract_wikilinks, Wikilink};
use crate::writer::read_with_retry;

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub include_embeds: bool,
    pub include_frontmatter: bool,
    pub case_sensitive_target_match: bool,
    pub skip_code_blocks: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_embeds: true,
            include_frontmatter: false,
            case_sensitive_target_match: false,
            skip_code_blocks: true,
        }
    }
}

impl ScanOptions {
    /// The options the transaction manager's plan phase always uses: a
    /// rename must see links inside frontmatter too.
    pub fn for_rename() -> Self {
        Self {
            include_frontmatter: true,
            ..Self::default()
        }
    }
}

/// All distinct sources and raw occurrences that point at one normalized
/// target stem.
#[derive(Debug, Default)]
pub struct TargetGroup {
    pub sources: HashSet<PathBuf>,
    pub links: Vec<Wikilink>,
}

/// Extracts every wikilink from one note, applying `opts`.
pub fn scan_note(path: &Path, opts: &ScanOptions) -> Result<Vec<Wikilink>> {
    let bytes = read_with_retry(path)?;
    let content = String::from_utf8_lossy(&bytes).into_owned();

    let fm_span = frontmatter_span(&content);
    let code_spans = if opts.skip_code_blocks {
        code_block_spans(&content)
    } else {
        Vec::new()
    };

    let mut links = extract_wikilinks(&content, path, false);
    links.retain(|link| {
        let in_frontmatter = in_span(fm_span, link.col_start);
        if in_frontmatter {
            opts.include_frontmatter
        } else if in_any_span(&code_spans, link.col_start) {
            false
        } else {
            opts.include_embeds || !link.is_embed
        }
    });
    for link in &mut links {
        link.in_frontmatter = in_span(fm_span, link.col_start);
    }

    Ok(links)
}

/// Walks the whole vault (markdown files only) and extracts every wikilink.
pub fn scan_vault(vault_root: &Path, opts: &ScanOptions) -> Result<Vec<Wikilink>> {
    let mut links = Vec::new();
    for entry in WalkDir::new(vault_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_markdown_file(e.path()))
    {
        links.extend(scan_note(entry.path(), opts)?);
    }
    Ok(links)
}

/// Groups a flat link list by normalized target stem.
pub fn group_by_target(
    links: Vec<Wikilink>,
    case_sensitive: bool,
) -> HashMap<String, TargetGroup> {
    let mut map: HashMap<String, TargetGroup> = HashMap::new();
    for link in links {
        let key = if case_sensitive {
            link.target.clone()
        } else {
            link.target.to_lowercase()
        };
        let group = map.entry(key).or_default();
        group.sources.insert(link.source_path.clone());
        group.links.push(link);
    }
    map
}

fn in_span(span: Option<(usize, usize)>, offset: usize) -> bool {
    span.is_some_and(|(start, end)| offset >= start && offset < end)
}

/// Byte range of the raw YAML frontmatter header, if present. Mirrors the
/// same Unicode-safe delimiter search used for full frontmatter parsing
/// elsewhere in this codebase, since the rewriter must preserve the
/// surrounding YAML byte-for-byte rather than round-tripping it through a
/// YAML parser.
fn frontmatter_span(content: &str) -> Option<(usize, usize)> {
    if !content.starts_with("---\n") {
        return None;
    }
    let search_from = 4;
    let rest = content.get(search_from..)?;
    let relative = rest.find("\n---")?;
    let closer_start = search_from + relative + 1;
    let closer_end = closer_start + 3;
    let after = content.get(closer_end..)?;
    if after.is_empty() || after.starts_with('\n') || after.starts_with(char::is_whitespace) {
        Some((0, closer_end))
    } else {
        None
    }
}
