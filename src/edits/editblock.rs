//! SEARCH/REPLACE block parsing and matching
//!
//! The model marks each change with conflict-style markers:
//!
//! ```text
//! path/to/file.rs
//! <<<<<<< SEARCH
//! old lines
//! =======
//! new lines
//! >>>>>>> REPLACE
//! ```
//!
//! Parsing is lenient about the decoration around blocks (fences, backticks,
//! bold, trailing colons) because models decorate inconsistently. Matching
//! at apply time is not lenient about location: the search text must resolve
//! to exactly one spot, first by exact containment, then by
//! whitespace-normalized line comparison. Zero or multiple matches is an
//! error naming the file and fragment; quill never silently picks one.

use super::{Edit, EditKind};
use crate::error::CoderError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// How strictly code-fence boundaries are enforced around blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceRule {
    /// Markers may appear anywhere; the filename is the nearest preceding
    /// non-blank line.
    Lenient,
    /// Every block must sit inside a fence with the filename as the first
    /// line inside it. For providers that corrupt nested fences.
    Strict,
}

fn search_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^<{5,9} *SEARCH\s*$").unwrap())
}

fn divider_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^={5,9}\s*$").unwrap())
}

fn replace_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^>{5,9} *REPLACE\s*$").unwrap())
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Strip the decoration models wrap around filenames.
fn clean_filename(line: &str) -> String {
    let mut s = line.trim();
    loop {
        let before = s;
        s = s
            .trim_matches('*')
            .trim_matches('`')
            .trim_end_matches(':')
            .trim();
        if s == before {
            break;
        }
    }
    s.to_string()
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains("```")
        && !candidate.chars().any(char::is_whitespace)
}

/// Parse SEARCH/REPLACE blocks out of a response.
pub fn parse(response: &str, rule: FenceRule) -> Result<Vec<Edit>, CoderError> {
    let lines: Vec<&str> = response.lines().collect();
    let mut edits = Vec::new();
    let mut last_filename: Option<String> = None;
    let mut i = 0;

    while i < lines.len() {
        if !search_marker().is_match(lines[i]) {
            i += 1;
            continue;
        }

        let filename = match rule {
            FenceRule::Lenient => filename_before(&lines, i, &last_filename),
            FenceRule::Strict => filename_in_fence(&lines, i),
        }
        .ok_or_else(|| CoderError::Parse {
            path: None,
            reason: "SEARCH block without a filename line".into(),
        })?;

        // Collect the search section.
        i += 1;
        let mut search = Vec::new();
        while i < lines.len() && !divider_marker().is_match(lines[i]) {
            if replace_marker().is_match(lines[i]) {
                return Err(CoderError::Parse {
                    path: Some(PathBuf::from(&filename)),
                    reason: "expected ======= before >>>>>>> REPLACE".into(),
                });
            }
            search.push(lines[i]);
            i += 1;
        }
        if i >= lines.len() {
            return Err(CoderError::Parse {
                path: Some(PathBuf::from(&filename)),
                reason: "unterminated SEARCH section (missing =======)".into(),
            });
        }

        // Collect the replace section.
        i += 1;
        let mut replace = Vec::new();
        while i < lines.len() && !replace_marker().is_match(lines[i]) {
            if search_marker().is_match(lines[i]) {
                return Err(CoderError::Parse {
                    path: Some(PathBuf::from(&filename)),
                    reason: "nested SEARCH marker inside replace section".into(),
                });
            }
            replace.push(lines[i]);
            i += 1;
        }
        if i >= lines.len() {
            return Err(CoderError::Parse {
                path: Some(PathBuf::from(&filename)),
                reason: "unterminated replace section (missing >>>>>>> REPLACE)".into(),
            });
        }
        i += 1;

        if rule == FenceRule::Strict {
            // The line after REPLACE must close the fence.
            let next = lines.get(i).copied().unwrap_or("");
            if !is_fence(next) {
                return Err(CoderError::Parse {
                    path: Some(PathBuf::from(&filename)),
                    reason: "block not closed with a code fence".into(),
                });
            }
            i += 1;
        }

        last_filename = Some(filename.clone());
        edits.push(Edit {
            path: PathBuf::from(filename),
            kind: EditKind::Replace {
                search: join_lines(&search),
                replace: join_lines(&replace),
            },
        });
    }

    Ok(edits)
}

/// Lenient filename resolution: nearest preceding non-blank, non-fence line,
/// falling back to the previous block's filename when the candidate does not
/// look like a path.
fn filename_before(
    lines: &[&str],
    marker_idx: usize,
    last_filename: &Option<String>,
) -> Option<String> {
    for j in (0..marker_idx).rev() {
        let line = lines[j];
        if line.trim().is_empty() || is_fence(line) {
            continue;
        }
        let candidate = clean_filename(line);
        if looks_like_path(&candidate) {
            return Some(candidate);
        }
        break;
    }
    last_filename.clone()
}

/// Strict filename resolution: the block's fence opens at most a couple of
/// lines above the marker with the filename as the first line inside it.
fn filename_in_fence(lines: &[&str], marker_idx: usize) -> Option<String> {
    if marker_idx < 2 {
        return None;
    }
    let name_line = lines[marker_idx - 1];
    let fence_line = lines[marker_idx - 2];
    if !is_fence(fence_line) {
        return None;
    }
    let candidate = clean_filename(name_line);
    looks_like_path(&candidate).then_some(candidate)
}

fn join_lines(lines: &[&str]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Replace `search` with `replace` in `content`, requiring exactly one match.
/// Exact containment is tried first, then whitespace-normalized line
/// matching. An empty search appends to (or creates) the file.
pub fn apply_replace(
    path: &Path,
    content: &str,
    search: &str,
    replace: &str,
) -> Result<String, CoderError> {
    if search.is_empty() {
        // New-file / append semantics.
        let mut updated = content.to_string();
        updated.push_str(replace);
        return Ok(updated);
    }

    // Pass 1: exact containment.
    let exact: Vec<usize> = match_indices_non_overlapping(content, search);
    match exact.len() {
        1 => {
            let idx = exact[0];
            let mut updated = String::with_capacity(content.len());
            updated.push_str(&content[..idx]);
            updated.push_str(replace);
            updated.push_str(&content[idx + search.len()..]);
            return Ok(updated);
        }
        n if n > 1 => {
            return Err(CoderError::AmbiguousEdit {
                path: path.to_path_buf(),
                reason: format!("search text matches {} locations", n),
            });
        }
        _ => {}
    }

    // Pass 2: line-wise match ignoring trailing whitespace, then ignoring
    // leading whitespace too. Tunable fallback, not a similarity score.
    for normalize in [str::trim_end as LineNormalizer, str::trim] {
        match fuzzy_line_replace(content, search, replace, normalize) {
            Ok(Some(updated)) => return Ok(updated),
            Ok(None) => {}
            Err(CoderError::AmbiguousEdit { reason, .. }) => {
                return Err(CoderError::AmbiguousEdit {
                    path: path.to_path_buf(),
                    reason,
                })
            }
            Err(err) => return Err(err),
        }
    }

    let fragment: String = search.lines().take(3).collect::<Vec<_>>().join("\n");
    Err(CoderError::AmbiguousEdit {
        path: path.to_path_buf(),
        reason: format!("search text not found; first lines were:\n{}", fragment),
    })
}

fn match_indices_non_overlapping(haystack: &str, needle: &str) -> Vec<usize> {
    let mut indices = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        indices.push(from + pos);
        from += pos + needle.len();
    }
    indices
}

type LineNormalizer = fn(&str) -> &str;

/// Sliding-window line comparison under a normalizer. Returns Ok(None) when
/// nothing matched (so the caller can try the next normalizer), Err on
/// ambiguity.
fn fuzzy_line_replace(
    content: &str,
    search: &str,
    replace: &str,
    normalize: LineNormalizer,
) -> Result<Option<String>, CoderError> {
    let content_lines: Vec<&str> = content.lines().collect();
    let search_lines: Vec<&str> = search.lines().collect();
    if search_lines.is_empty() || content_lines.len() < search_lines.len() {
        return Ok(None);
    }

    let window = search_lines.len();
    let mut starts = Vec::new();
    for start in 0..=(content_lines.len() - window) {
        let matches = (0..window)
            .all(|k| normalize(content_lines[start + k]) == normalize(search_lines[k]));
        if matches {
            starts.push(start);
        }
    }

    match starts.len() {
        0 => Ok(None),
        1 => {
            let start = starts[0];
            let mut lines: Vec<&str> = Vec::new();
            lines.extend_from_slice(&content_lines[..start]);
            lines.extend(replace.lines());
            lines.extend_from_slice(&content_lines[start + window..]);
            let mut updated = lines.join("\n");
            if content.ends_with('\n') {
                updated.push('\n');
            }
            Ok(Some(updated))
        }
        n => Err(CoderError::AmbiguousEdit {
            path: PathBuf::new(),
            reason: format!("search text matches {} locations after normalization", n),
        }),
    }
}
