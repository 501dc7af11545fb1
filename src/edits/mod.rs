//! Edit-format strategies
//!
//! Each format is one grammar the model can use to propose file changes.
//! They all converge on the same contract: parse free text into `Edit`s,
//! then apply those edits all-or-nothing per file. Selection is by explicit
//! `EditFormat` value, never inferred from response content.

pub mod editblock;
pub mod udiff;
pub mod wholefile;

use crate::chat::Message;
use crate::error::CoderError;
use crate::protocol::FileOutcome;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use udiff::Hunk;

/// The protocol the model is instructed to use for proposing edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EditFormat {
    /// SEARCH/REPLACE blocks with the filename on the preceding line.
    #[default]
    SearchReplace,
    /// SEARCH/REPLACE blocks with strict fence boundaries, for providers
    /// that corrupt nested fences.
    FencedSearchReplace,
    /// Unified diff hunks, re-anchored by context rather than line numbers.
    UnifiedDiff,
    /// Complete replacement content per file.
    WholeFile,
    /// No edits; conversational ask/help modes.
    None,
}

impl EditFormat {
    pub fn name(&self) -> &'static str {
        match self {
            EditFormat::SearchReplace => "search-replace",
            EditFormat::FencedSearchReplace => "fenced-search-replace",
            EditFormat::UnifiedDiff => "udiff",
            EditFormat::WholeFile => "wholefile",
            EditFormat::None => "none",
        }
    }

    pub fn from_name(name: &str) -> Option<EditFormat> {
        match name {
            "search-replace" => Some(EditFormat::SearchReplace),
            "fenced-search-replace" => Some(EditFormat::FencedSearchReplace),
            "udiff" => Some(EditFormat::UnifiedDiff),
            "wholefile" => Some(EditFormat::WholeFile),
            "none" | "ask" => Some(EditFormat::None),
            _ => None,
        }
    }

    /// Parse a model response into candidate edits.
    pub fn parse(&self, response: &str) -> Result<Vec<Edit>, CoderError> {
        match self {
            EditFormat::SearchReplace => editblock::parse(response, editblock::FenceRule::Lenient),
            EditFormat::FencedSearchReplace => {
                editblock::parse(response, editblock::FenceRule::Strict)
            }
            EditFormat::UnifiedDiff => udiff::parse(response),
            EditFormat::WholeFile => wholefile::parse(response),
            EditFormat::None => Ok(Vec::new()),
        }
    }

    /// System prompt fragment describing the grammar.
    pub fn system_prompt(&self) -> &'static str {
        match self {
            EditFormat::SearchReplace | EditFormat::FencedSearchReplace => {
                "You are an expert pair programmer. Propose changes as \
                 SEARCH/REPLACE blocks: the file path on its own line, then \
                 <<<<<<< SEARCH, the exact existing lines, =======, the \
                 replacement lines, and >>>>>>> REPLACE. Use an empty SEARCH \
                 section to create a new file. Never edit read-only files."
            }
            EditFormat::UnifiedDiff => {
                "You are an expert pair programmer. Propose changes as unified \
                 diffs inside ```diff fences, with a few lines of surrounding \
                 context per hunk. Line numbers are ignored; context lines \
                 locate the change. Never edit read-only files."
            }
            EditFormat::WholeFile => {
                "You are an expert pair programmer. For every file you change, \
                 reply with the file path on its own line followed by the \
                 complete new file content in a fenced code block. Never edit \
                 read-only files."
            }
            EditFormat::None => {
                "You are an expert pair programmer answering questions about \
                 the code. Do not propose file edits."
            }
        }
    }

    /// Few-shot example turns demonstrating the grammar.
    pub fn example_messages(&self) -> Vec<Message> {
        match self {
            EditFormat::SearchReplace | EditFormat::FencedSearchReplace => vec![
                Message::user("Rename get_factorial to factorial in mathweb/flask/app.py"),
                Message::assistant(
                    "mathweb/flask/app.py\n\
                     <<<<<<< SEARCH\n\
                     def get_factorial(n):\n\
                     =======\n\
                     def factorial(n):\n\
                     >>>>>>> REPLACE",
                ),
            ],
            EditFormat::UnifiedDiff => vec![
                Message::user("Remove the unused import in main.py"),
                Message::assistant(
                    "```diff\n\
                     --- main.py\n\
                     +++ main.py\n\
                     @@ -1,3 +1,2 @@\n\
                     -import os\n \
                     import sys\n \
                     \n\
                     ```",
                ),
            ],
            EditFormat::WholeFile => vec![
                Message::user("Create a hello module"),
                Message::assistant("hello.py\n```python\ndef hello():\n    print(\"hi\")\n```"),
            ],
            EditFormat::None => Vec::new(),
        }
    }
}

/// One proposed change to one file. Ephemeral: produced by parsing a single
/// response, consumed by validation and apply, then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub path: PathBuf,
    pub kind: EditKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditKind {
    /// Literal search text to replace. An empty search creates the file.
    Replace { search: String, replace: String },
    /// A unified-diff hunk, re-anchored by context at apply time.
    Hunk(Hunk),
    /// Complete replacement content for the file.
    WholeFile { content: String },
}

impl Edit {
    /// Whether this edit may legitimately target a path that does not exist.
    pub fn creates_file(&self) -> bool {
        match &self.kind {
            EditKind::Replace { search, .. } => search.is_empty(),
            EditKind::Hunk(hunk) => hunk.is_pure_addition(),
            EditKind::WholeFile { .. } => true,
        }
    }
}

/// Apply one file's edits to its current content. Pure content transform;
/// errors leave nothing half-applied because the caller only writes the
/// final string on success.
pub fn apply_to_content(
    path: &Path,
    content: Option<&str>,
    edits: &[&Edit],
) -> Result<String, CoderError> {
    let mut current = match content {
        Some(text) => text.to_string(),
        None => String::new(),
    };

    for edit in edits {
        current = match &edit.kind {
            EditKind::Replace { search, replace } => {
                editblock::apply_replace(path, &current, search, replace)?
            }
            EditKind::Hunk(hunk) => udiff::apply_hunk(path, &current, hunk)?,
            EditKind::WholeFile { content } => content.clone(),
        };
    }
    Ok(current)
}

/// The final content for one file, computed before anything touches disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub path: PathBuf,
    pub content: String,
    pub created: bool,
}

/// Group edits per file, preserving first-seen order.
fn group_by_file(edits: &[Edit]) -> Vec<(PathBuf, Vec<&Edit>)> {
    let mut order: Vec<PathBuf> = Vec::new();
    let mut by_file: BTreeMap<PathBuf, Vec<&Edit>> = BTreeMap::new();
    for edit in edits {
        if !by_file.contains_key(&edit.path) {
            order.push(edit.path.clone());
        }
        by_file.entry(edit.path.clone()).or_default().push(edit);
    }
    order
        .into_iter()
        .map(|path| {
            let edits = by_file.remove(&path).unwrap_or_default();
            (path, edits)
        })
        .collect()
}

/// Dry-run every file's edits against current disk content. The first
/// match failure aborts the whole plan, so validation errors never leave a
/// response cycle half-applied.
pub fn plan_edits(root: &Path, edits: &[Edit]) -> Result<Vec<PlannedWrite>, CoderError> {
    let mut plan = Vec::new();
    for (rel, file_edits) in group_by_file(edits) {
        let abs = root.join(&rel);
        let existing = match fs::read_to_string(&abs) {
            Ok(text) => Some(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(CoderError::Apply {
                    path: rel,
                    reason: format!("read failed: {}", err),
                })
            }
        };
        let created = existing.is_none();
        let content = apply_to_content(&rel, existing.as_deref(), &file_edits)?;
        plan.push(PlannedWrite {
            path: rel,
            content,
            created,
        });
    }
    Ok(plan)
}

/// Write a validated plan to disk. Per-file: an IO failure on one file is
/// reported individually and does not stop sibling files.
pub fn write_planned(root: &Path, plan: &[PlannedWrite]) -> Vec<(PathBuf, FileOutcome)> {
    let mut outcomes = Vec::with_capacity(plan.len());
    for planned in plan {
        let abs = root.join(&planned.path);
        let write_result = abs
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .and_then(|_| fs::write(&abs, &planned.content));
        match write_result {
            Ok(()) => outcomes.push((
                planned.path.clone(),
                FileOutcome::Applied {
                    created: planned.created,
                },
            )),
            Err(err) => outcomes.push((
                planned.path.clone(),
                FileOutcome::Failed {
                    reason: format!("write failed: {}", err),
                },
            )),
        }
    }
    outcomes
}

/// Apply a response cycle's edits beneath `root`, all-or-nothing at the file
/// level: a failure in one file's edit set leaves that file untouched and is
/// reported individually, while sibling files still proceed.
pub fn apply_edits(root: &Path, edits: &[Edit]) -> Vec<(PathBuf, FileOutcome)> {
    let mut outcomes = Vec::new();
    for (rel, file_edits) in group_by_file(edits) {
        let singleton: Vec<Edit> = file_edits.into_iter().cloned().collect();
        match plan_edits(root, &singleton) {
            Ok(plan) => outcomes.extend(write_planned(root, &plan)),
            Err(err) => outcomes.push((
                rel,
                FileOutcome::Failed {
                    reason: err.to_string(),
                },
            )),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names_round_trip() {
        for format in [
            EditFormat::SearchReplace,
            EditFormat::FencedSearchReplace,
            EditFormat::UnifiedDiff,
            EditFormat::WholeFile,
            EditFormat::None,
        ] {
            assert_eq!(EditFormat::from_name(format.name()), Some(format));
        }
        assert_eq!(EditFormat::from_name("ask"), Some(EditFormat::None));
        assert_eq!(EditFormat::from_name("bogus"), None);
    }

    #[test]
    fn test_none_format_parses_to_empty() {
        let edits = EditFormat::None
            .parse("Here is a long explanation with ``` fences and no edits.")
            .unwrap();
        assert!(edits.is_empty());
    }

    #[test]
    fn test_apply_edits_reports_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "hello world\n").unwrap();

        let edits = vec![
            Edit {
                path: PathBuf::from("ok.txt"),
                kind: EditKind::Replace {
                    search: "hello".into(),
                    replace: "goodbye".into(),
                },
            },
            Edit {
                path: PathBuf::from("missing.txt"),
                kind: EditKind::Replace {
                    search: "nothing matches this".into(),
                    replace: "x".into(),
                },
            },
        ];

        let outcomes = apply_edits(dir.path(), &edits);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_applied());
        assert!(!outcomes[1].1.is_applied());

        // The successful file landed; the failed one was never created.
        let content = std::fs::read_to_string(dir.path().join("ok.txt")).unwrap();
        assert_eq!(content, "goodbye world\n");
        assert!(!dir.path().join("missing.txt").exists());
    }

    #[test]
    fn test_apply_edits_failure_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "alpha\nbeta\nalpha\n").unwrap();

        // Second edit is ambiguous; the first alone would have applied.
        let edits = vec![
            Edit {
                path: PathBuf::from("a.txt"),
                kind: EditKind::Replace {
                    search: "beta".into(),
                    replace: "BETA".into(),
                },
            },
            Edit {
                path: PathBuf::from("a.txt"),
                kind: EditKind::Replace {
                    search: "alpha".into(),
                    replace: "ALPHA".into(),
                },
            },
        ];

        let outcomes = apply_edits(dir.path(), &edits);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].1.is_applied());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "alpha\nbeta\nalpha\n"
        );
    }

    #[test]
    fn test_apply_edits_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let edits = vec![Edit {
            path: PathBuf::from("src/new.rs"),
            kind: EditKind::WholeFile {
                content: "pub fn fresh() {}\n".into(),
            },
        }];

        let outcomes = apply_edits(dir.path(), &edits);
        assert_eq!(
            outcomes[0].1,
            FileOutcome::Applied { created: true }
        );
        assert!(dir.path().join("src/new.rs").exists());
    }

    #[test]
    fn test_whole_file_apply_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let edits = vec![Edit {
            path: PathBuf::from("same.rs"),
            kind: EditKind::WholeFile {
                content: "fn main() {}\n".into(),
            },
        }];

        apply_edits(dir.path(), &edits);
        let first = std::fs::read_to_string(dir.path().join("same.rs")).unwrap();
        let outcomes = apply_edits(dir.path(), &edits);
        let second = std::fs::read_to_string(dir.path().join("same.rs")).unwrap();

        assert_eq!(first, second);
        assert_eq!(outcomes[0].1, FileOutcome::Applied { created: false });
    }
}
