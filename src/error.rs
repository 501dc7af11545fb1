//! Error taxonomy for the coder turn cycle
//!
//! Parse, ambiguity, and read-only failures are recoverable: the coordinator
//! feeds them back to the model as corrective messages. Repository, apply,
//! and commit failures surface to the caller with enough detail to act on.

use std::path::PathBuf;

/// Errors produced while driving one coder turn.
#[derive(Debug, thiserror::Error)]
pub enum CoderError {
    /// No git repository found, or the candidate paths span more than one.
    #[error("repository unavailable: {0}")]
    RepositoryUnavailable(String),

    /// Projected prompt exceeds the model's context window under strict policy.
    #[error("context overflow: {tokens} tokens projected, window is {window}")]
    ContextOverflow { tokens: usize, window: usize },

    /// The response did not match the active edit format's grammar.
    #[error("could not parse edits{}: {reason}", fmt_path(.path))]
    Parse {
        path: Option<PathBuf>,
        reason: String,
    },

    /// Search or context text resolved to zero or multiple locations.
    #[error("edit for {path} is ambiguous: {reason}")]
    AmbiguousEdit { path: PathBuf, reason: String },

    /// An edit targeted a path matched by the read-only spec.
    #[error("{path} is read-only")]
    ReadOnlyViolation { path: PathBuf },

    /// Writing one file's edits failed. Sibling files are reported separately.
    #[error("failed to apply edits to {path}: {reason}")]
    Apply { path: PathBuf, reason: String },

    /// The version-control commit step failed. Applied edits are not rolled back.
    #[error("commit failed: {0}")]
    CommitFailure(String),

    /// The model kept producing unusable output past the configured retry budget.
    #[error("gave up after {attempts} repair attempts: {last_failure}")]
    RetriesExhausted {
        attempts: usize,
        last_failure: String,
        /// Corrective messages sent during the repair loop, for diagnostics.
        transcript: Vec<String>,
    },

    /// The model call itself failed and the caller opted not to retry it.
    #[error("model request failed: {0}")]
    Model(#[from] anyhow::Error),
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

impl CoderError {
    /// Whether the repair loop may recover from this error by re-prompting.
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            CoderError::Parse { .. }
                | CoderError::AmbiguousEdit { .. }
                | CoderError::ReadOnlyViolation { .. }
        )
    }

    /// Message appended as a corrective user turn so the model can self-correct.
    pub fn corrective_message(&self) -> String {
        match self {
            CoderError::Parse { path, reason } => match path {
                Some(p) => format!(
                    "Your edits to {} could not be parsed: {}. \
                     Reply with corrected edit blocks in the required format.",
                    p.display(),
                    reason
                ),
                None => format!(
                    "Your response could not be parsed: {}. \
                     Reply with corrected edit blocks in the required format.",
                    reason
                ),
            },
            CoderError::AmbiguousEdit { path, reason } => format!(
                "The edit for {} is ambiguous: {}. \
                 Include more surrounding lines so the location is unique.",
                path.display(),
                reason
            ),
            CoderError::ReadOnlyViolation { path } => format!(
                "{} is read-only and must not be edited. \
                 Propose changes to editable files only.",
                path.display()
            ),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_ambiguity_are_repairable() {
        let parse = CoderError::Parse {
            path: None,
            reason: "missing REPLACE marker".into(),
        };
        let ambiguous = CoderError::AmbiguousEdit {
            path: PathBuf::from("src/lib.rs"),
            reason: "2 matches".into(),
        };
        assert!(parse.is_repairable());
        assert!(ambiguous.is_repairable());
    }

    #[test]
    fn test_apply_and_commit_are_not_repairable() {
        let apply = CoderError::Apply {
            path: PathBuf::from("src/lib.rs"),
            reason: "permission denied".into(),
        };
        let commit = CoderError::CommitFailure("index locked".into());
        assert!(!apply.is_repairable());
        assert!(!commit.is_repairable());
    }

    #[test]
    fn test_corrective_message_names_the_file() {
        let err = CoderError::ReadOnlyViolation {
            path: PathBuf::from("docs/spec.md"),
        };
        let msg = err.corrective_message();
        assert!(msg.contains("docs/spec.md"));
        assert!(msg.contains("read-only"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = CoderError::ContextOverflow {
            tokens: 9000,
            window: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("9000"));
        assert!(msg.contains("8192"));
    }
}
