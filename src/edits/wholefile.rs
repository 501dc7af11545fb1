//! Whole-file replacement format
//!
//! The simplest grammar: the file path on its own line, then a fenced code
//! block holding the complete new content. Used as the fallback when
//! structural edits repeatedly fail to parse or apply. Application is an
//! unconditional overwrite, so applying the same content twice is a no-op.

use super::{Edit, EditKind};
use crate::error::CoderError;
use std::path::PathBuf;

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn clean_filename(line: &str) -> String {
    line.trim()
        .trim_matches('*')
        .trim_matches('`')
        .trim_end_matches(':')
        .trim()
        .to_string()
}

fn looks_like_path(candidate: &str) -> bool {
    !candidate.is_empty()
        && !candidate.contains("```")
        && !candidate.chars().any(char::is_whitespace)
}

/// Parse filename + fenced content pairs out of a response.
pub fn parse(response: &str) -> Result<Vec<Edit>, CoderError> {
    let lines: Vec<&str> = response.lines().collect();
    let mut edits = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !is_fence(lines[i]) {
            i += 1;
            continue;
        }

        // Filename is the nearest preceding non-blank line.
        let mut filename = None;
        for j in (0..i).rev() {
            let line = lines[j];
            if line.trim().is_empty() {
                continue;
            }
            if is_fence(line) {
                break;
            }
            let candidate = clean_filename(line);
            if looks_like_path(&candidate) {
                filename = Some(candidate);
            }
            break;
        }
        let filename = filename.ok_or_else(|| CoderError::Parse {
            path: None,
            reason: "code block without a filename line before it".into(),
        })?;

        // Collect fenced content.
        i += 1;
        let mut content_lines = Vec::new();
        while i < lines.len() && !is_fence(lines[i]) {
            content_lines.push(lines[i]);
            i += 1;
        }
        if i >= lines.len() {
            return Err(CoderError::Parse {
                path: Some(PathBuf::from(&filename)),
                reason: "unterminated code block (missing closing fence)".into(),
            });
        }
        i += 1;

        let mut content = content_lines.join("\n");
        content.push('\n');
        edits.push(Edit {
            path: PathBuf::from(filename),
            kind: EditKind::WholeFile { content },
        });
    }

    if edits.is_empty() {
        return Err(CoderError::Parse {
            path: None,
            reason: "no fenced file content found in response".into(),
        });
    }
    Ok(edits)
}
