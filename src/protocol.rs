//! Caller-facing types for the coder core
//!
//! The core knows nothing about HTTP or SSE; it emits a sequence of progress
//! events through an optional channel and returns a `TurnReport` when a turn
//! seals. The surface layer shapes these however it likes.

use crate::model::Usage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A commit created by the repository adapter. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Abbreviated commit hash.
    pub hash: String,
    pub message: String,
    /// Whether the identity carried the tool-attribution suffix.
    pub attributed: bool,
}

/// Outcome of applying one file's edits within a response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileOutcome {
    /// Edits landed on disk.
    Applied { created: bool },
    /// Edits were rejected or the write failed; the file is untouched.
    Failed { reason: String },
}

impl FileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, FileOutcome::Applied { .. })
    }
}

/// Incremental progress for one turn.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Streamed assistant text.
    Chunk(String),
    /// A repair attempt is starting; `attempt` is 1-based.
    RepairAttempt { attempt: usize, max: usize, reason: String },
    /// Projected prompt exceeded the window under the warn policy.
    ContextWarning { tokens: usize, window: usize },
    /// One file's apply outcome.
    FileApplied { path: PathBuf, outcome: FileOutcome },
    /// A commit was created for the turn's touched files.
    Committed(CommitRecord),
    /// A post-apply check failed; output feeds the repair loop.
    CheckFailed { name: String, output: String },
    /// Usage delta for one model call.
    Usage(Usage),
}

/// Result of one completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReport {
    pub turn_id: Uuid,
    pub completed_at: DateTime<Utc>,
    /// Assistant text from the final (successful) response.
    pub response: String,
    /// Per-file outcomes from the final apply, in response order.
    pub files: Vec<(PathBuf, FileOutcome)>,
    pub commit: Option<CommitRecord>,
    /// Accumulated usage across the turn, repair attempts included.
    pub usage: Usage,
    /// Total responses consumed, 1 when no repairs were needed.
    pub attempts: usize,
}

impl TurnReport {
    /// Paths whose edits landed on disk.
    pub fn applied_paths(&self) -> Vec<&PathBuf> {
        self.files
            .iter()
            .filter(|(_, o)| o.is_applied())
            .map(|(p, _)| p)
            .collect()
    }

    /// Human summary of per-file failures, empty when everything applied.
    pub fn failure_summary(&self) -> String {
        self.files
            .iter()
            .filter_map(|(path, outcome)| match outcome {
                FileOutcome::Failed { reason } => {
                    Some(format!("{}: {}", path.display(), reason))
                }
                FileOutcome::Applied { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> TurnReport {
        TurnReport {
            turn_id: Uuid::new_v4(),
            completed_at: Utc::now(),
            response: "done".into(),
            files: vec![
                (
                    PathBuf::from("src/a.rs"),
                    FileOutcome::Applied { created: false },
                ),
                (
                    PathBuf::from("src/b.rs"),
                    FileOutcome::Failed {
                        reason: "permission denied".into(),
                    },
                ),
            ],
            commit: None,
            usage: Usage::default(),
            attempts: 1,
        }
    }

    #[test]
    fn test_applied_paths_filters_failures() {
        let report = sample_report();
        let applied = report.applied_paths();
        assert_eq!(applied, vec![&PathBuf::from("src/a.rs")]);
    }

    #[test]
    fn test_failure_summary_names_path_and_reason() {
        let report = sample_report();
        let summary = report.failure_summary();
        assert!(summary.contains("src/b.rs"));
        assert!(summary.contains("permission denied"));
        assert!(!summary.contains("src/a.rs"));
    }

    #[test]
    fn test_turn_report_round_trips_through_json() {
        let report = sample_report();
        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: TurnReport = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.files, report.files);
        assert_eq!(decoded.attempts, 1);
    }
}
