//! Unified diff parsing and context-anchored application
//!
//! Models routinely hallucinate hunk header line numbers, so application
//! never trusts them: each hunk is re-anchored by locating its context and
//! removed lines in the target file. Small context drift is tolerated up to
//! a bounded fuzz distance; past that the hunk is rejected rather than
//! guessed at.

use super::{Edit, EditKind};
use crate::error::CoderError;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Maximum context lines shrunk from each end of a hunk while re-anchoring.
pub const MAX_CONTEXT_FUZZ: usize = 2;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk: one change region with its surrounding context lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Lines expected in the file before the change (context + removed).
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines present after the change (context + added).
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s.as_str()),
                DiffLine::Remove(_) => None,
            })
            .collect()
    }

    /// A hunk with no context and no removals can only mean new content.
    pub fn is_pure_addition(&self) -> bool {
        self.lines
            .iter()
            .all(|l| matches!(l, DiffLine::Add(_)))
    }

    /// Leading context length, capped at what shrinking may remove.
    fn leading_context(&self) -> usize {
        self.lines
            .iter()
            .take_while(|l| matches!(l, DiffLine::Context(_)))
            .count()
    }

    fn trailing_context(&self) -> usize {
        self.lines
            .iter()
            .rev()
            .take_while(|l| matches!(l, DiffLine::Context(_)))
            .count()
    }
}

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^@@[^@]*@@").unwrap())
}

fn strip_diff_prefix(path: &str) -> String {
    let path = path.trim();
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    // Drop a timestamp suffix if present.
    match path.find('\t') {
        Some(tab) => path[..tab].to_string(),
        None => path.to_string(),
    }
}

/// Parse unified diffs out of a response. Accepts diffs inside ```diff
/// fences or raw; hunk header line numbers are recorded nowhere because
/// application re-derives every position from context.
pub fn parse(response: &str) -> Result<Vec<Edit>, CoderError> {
    let lines: Vec<&str> = response.lines().collect();
    let mut edits = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut saw_header = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(old) = line.strip_prefix("--- ") {
            let next = lines.get(i + 1).copied().unwrap_or("");
            let new = next.strip_prefix("+++ ").ok_or_else(|| CoderError::Parse {
                path: None,
                reason: "diff header missing +++ line".into(),
            })?;
            let old_path = strip_diff_prefix(old);
            let new_path = strip_diff_prefix(new);
            if new_path == "/dev/null" {
                return Err(CoderError::Parse {
                    path: Some(PathBuf::from(old_path)),
                    reason: "file deletion diffs are not supported".into(),
                });
            }
            current_path = Some(PathBuf::from(new_path));
            saw_header = true;
            i += 2;
            continue;
        }

        if hunk_header().is_match(line) {
            let path = current_path.clone().ok_or_else(|| CoderError::Parse {
                path: None,
                reason: "hunk before any --- / +++ file header".into(),
            })?;
            i += 1;
            let mut hunk_lines = Vec::new();
            while i < lines.len() {
                let l = lines[i];
                if hunk_header().is_match(l)
                    || l.starts_with("--- ")
                    || l.starts_with("+++ ")
                    || l.starts_with("diff ")
                    || l.trim_start().starts_with("```")
                {
                    break;
                }
                if let Some(rest) = l.strip_prefix('+') {
                    hunk_lines.push(DiffLine::Add(rest.to_string()));
                } else if let Some(rest) = l.strip_prefix('-') {
                    hunk_lines.push(DiffLine::Remove(rest.to_string()));
                } else if let Some(rest) = l.strip_prefix(' ') {
                    hunk_lines.push(DiffLine::Context(rest.to_string()));
                } else if l.is_empty() {
                    hunk_lines.push(DiffLine::Context(String::new()));
                }
                // Other lines ("\ No newline at end of file") are skipped.
                i += 1;
            }
            if hunk_lines.is_empty() {
                return Err(CoderError::Parse {
                    path: Some(path),
                    reason: "empty hunk".into(),
                });
            }
            edits.push(Edit {
                path,
                kind: EditKind::Hunk(Hunk { lines: hunk_lines }),
            });
            continue;
        }

        i += 1;
    }

    if saw_header && edits.is_empty() {
        return Err(CoderError::Parse {
            path: current_path,
            reason: "diff header without any hunks".into(),
        });
    }
    Ok(edits)
}

type LineNormalizer = fn(&str) -> &str;

fn identity(s: &str) -> &str {
    s
}

fn find_window(content: &[&str], pattern: &[&str], normalize: LineNormalizer) -> Vec<usize> {
    if pattern.is_empty() || content.len() < pattern.len() {
        return Vec::new();
    }
    let mut starts = Vec::new();
    for start in 0..=(content.len() - pattern.len()) {
        let matches = (0..pattern.len())
            .all(|k| normalize(content[start + k]) == normalize(pattern[k]));
        if matches {
            starts.push(start);
        }
    }
    starts
}

/// Apply one hunk to `content`, re-anchoring by context. Matching passes:
/// exact, trailing-whitespace-insensitive, fully-trimmed, then the same
/// ladder with up to `MAX_CONTEXT_FUZZ` context lines shrunk from each end.
pub fn apply_hunk(path: &Path, content: &str, hunk: &Hunk) -> Result<String, CoderError> {
    if hunk.is_pure_addition() {
        if content.is_empty() {
            let mut created = hunk.new_lines().join("\n");
            created.push('\n');
            return Ok(created);
        }
        return Err(CoderError::Parse {
            path: Some(path.to_path_buf()),
            reason: "hunk has no context lines to locate the insertion point".into(),
        });
    }

    let content_lines: Vec<&str> = content.lines().collect();
    let normalizers: [LineNormalizer; 3] = [identity, str::trim_end, str::trim];

    let max_shrink = MAX_CONTEXT_FUZZ.min(hunk.leading_context());
    let max_shrink_tail = MAX_CONTEXT_FUZZ.min(hunk.trailing_context());

    for shrink_head in 0..=max_shrink {
        for shrink_tail in 0..=max_shrink_tail {
            let old: Vec<&str> = hunk.old_lines();
            let new: Vec<&str> = hunk.new_lines();
            if shrink_head + shrink_tail >= old.len() {
                continue;
            }
            let old = &old[shrink_head..old.len() - shrink_tail];
            let new = &new[shrink_head..new.len() - shrink_tail];

            for normalize in normalizers {
                let starts = find_window(&content_lines, old, normalize);
                match starts.len() {
                    0 => continue,
                    1 => {
                        let start = starts[0];
                        let mut lines: Vec<&str> = Vec::new();
                        lines.extend_from_slice(&content_lines[..start]);
                        lines.extend_from_slice(new);
                        lines.extend_from_slice(&content_lines[start + old.len()..]);
                        let mut updated = lines.join("\n");
                        if content.ends_with('\n') || content.is_empty() {
                            updated.push('\n');
                        }
                        return Ok(updated);
                    }
                    n => {
                        return Err(CoderError::AmbiguousEdit {
                            path: path.to_path_buf(),
                            reason: format!("hunk context matches {} locations", n),
                        })
                    }
                }
            }
        }
    }

    Err(CoderError::Parse {
        path: Some(path.to_path_buf()),
        reason: format!(
            "hunk context not found within fuzz tolerance ({} lines per side)",
            MAX_CONTEXT_FUZZ
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_DIFF: &str = "\
```diff
--- a/src/example.rs
+++ b/src/example.rs
@@ -1,4 +1,4 @@
 fn hello() {
-    log(\"old\");
+    log(\"new\");
     done()
 }
```
";

    fn parse_one(response: &str) -> (PathBuf, Hunk) {
        let edits = parse(response).unwrap();
        assert_eq!(edits.len(), 1);
        let edit = edits.into_iter().next().unwrap();
        match edit.kind {
            EditKind::Hunk(hunk) => (edit.path, hunk),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_diff() {
        let (path, hunk) = parse_one(SIMPLE_DIFF);
        assert_eq!(path, PathBuf::from("src/example.rs"));
        assert_eq!(hunk.old_lines().len(), 4);
        assert_eq!(hunk.new_lines().len(), 4);
    }

    #[test]
    fn test_parse_multiple_hunks() {
        let response = "\
--- a/lib.rs
+++ b/lib.rs
@@ -1,2 +1,2 @@
 mod a;
-mod old;
+mod new;
@@ -10,2 +10,2 @@
 mod z;
-mod stale;
+mod fresh;
";
        let edits = parse(response).unwrap();
        assert_eq!(edits.len(), 2);
        assert!(edits.iter().all(|e| e.path == PathBuf::from("lib.rs")));
    }

    #[test]
    fn test_parse_header_without_hunks_is_error() {
        let response = "--- a/lib.rs\n+++ b/lib.rs\njust prose\n";
        let err = parse(response).unwrap_err();
        assert!(err.to_string().contains("without any hunks"));
    }

    #[test]
    fn test_parse_hunk_without_header_is_error() {
        let response = "@@ -1,2 +1,2 @@\n old\n-gone\n+here\n";
        let err = parse(response).unwrap_err();
        assert!(err.to_string().contains("file header"));
    }

    #[test]
    fn test_parse_rejects_deletion_diffs() {
        let response = "--- a/dead.rs\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\n";
        assert!(parse(response).is_err());
    }

    #[test]
    fn test_apply_ignores_hallucinated_line_numbers() {
        // Header claims line 1; the real match is much further down.
        let content = "a\nb\nc\nd\ne\nfn hello() {\n    log(\"old\");\n    done()\n}\n";
        let (path, hunk) = parse_one(SIMPLE_DIFF);
        let updated = apply_hunk(&path, content, &hunk).unwrap();
        assert!(updated.contains("log(\"new\");"));
        assert!(!updated.contains("log(\"old\");"));
        // Unrelated prefix untouched.
        assert!(updated.starts_with("a\nb\nc\nd\ne\n"));
    }

    #[test]
    fn test_apply_within_fuzz_tolerance() {
        // Leading context line is wrong; shrinking one line recovers it.
        let response = "\
--- a/x.rs
+++ b/x.rs
@@ -1,4 +1,4 @@
 wrong_context()
 real_one()
-target()
+replacement()
 after()
";
        let (path, hunk) = parse_one(response);
        let content = "different()\nreal_one()\ntarget()\nafter()\n";
        let updated = apply_hunk(&path, content, &hunk).unwrap();
        assert_eq!(updated, "different()\nreal_one()\nreplacement()\nafter()\n");
    }

    #[test]
    fn test_apply_beyond_fuzz_tolerance_is_error() {
        // All three leading context lines are wrong; fuzz caps at two.
        let response = "\
--- a/x.rs
+++ b/x.rs
@@ -1,5 +1,5 @@
 wrong1()
 wrong2()
 wrong3()
-target()
+replacement()
";
        let (path, hunk) = parse_one(response);
        let content = "real1()\nreal2()\nreal3()\ntarget()\n";
        let err = apply_hunk(&path, content, &hunk).unwrap_err();
        assert!(matches!(err, CoderError::Parse { .. }));
        assert!(err.to_string().contains("fuzz tolerance"));
    }

    #[test]
    fn test_apply_ambiguous_context_is_error() {
        let response = "\
--- a/x.rs
+++ b/x.rs
@@ -1,2 +1,2 @@
 setup()
-run()
+run_fast()
";
        let (path, hunk) = parse_one(response);
        let content = "setup()\nrun()\nteardown()\nsetup()\nrun()\n";
        let err = apply_hunk(&path, content, &hunk).unwrap_err();
        assert!(matches!(err, CoderError::AmbiguousEdit { .. }));
    }

    #[test]
    fn test_apply_trailing_whitespace_drift() {
        let response = "\
--- a/x.rs
+++ b/x.rs
@@ -1,2 +1,2 @@
 keep()
-change()
+changed()
";
        let (path, hunk) = parse_one(response);
        let content = "keep()   \nchange()\n";
        let updated = apply_hunk(&path, content, &hunk).unwrap();
        assert!(updated.contains("changed()"));
    }

    #[test]
    fn test_apply_pure_addition_creates_new_file() {
        let response = "\
--- /dev/null
+++ b/new.rs
@@ -0,0 +1,2 @@
+fn fresh() {
+}
";
        let (path, hunk) = parse_one(response);
        assert!(hunk.is_pure_addition());
        let created = apply_hunk(&path, "", &hunk).unwrap();
        assert_eq!(created, "fn fresh() {\n}\n");
    }

    #[test]
    fn test_apply_pure_addition_to_existing_file_is_error() {
        let response = "\
--- /dev/null
+++ b/new.rs
@@ -0,0 +1,1 @@
+orphan()
";
        let (path, hunk) = parse_one(response);
        let err = apply_hunk(&path, "existing()\n", &hunk).unwrap_err();
        assert!(err.to_string().contains("no context"));
    }
}
