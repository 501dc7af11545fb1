//! Coordinator for the edit cycle
//!
//! The `Coder` owns one active edit format, the file set, and the
//! conversation, and drives each turn through an explicit state machine:
//! awaiting response, parsing, validating, applying, committing, sealed.
//! Parse and validation failures re-enter the loop with a corrective user
//! message so the model can self-correct, bounded by a retry budget.
//! The loop is explicit with a counter, never recursion.

use crate::chat::{ChatHistory, FileContext, Message, OverflowPolicy};
use crate::checks;
use crate::edits::{self, Edit, EditFormat};
use crate::error::CoderError;
use crate::locks::RepoLock;
use crate::model::{ModelClient, Usage};
use crate::protocol::{CommitRecord, ProgressEvent, TurnReport};
use crate::repo::GitRepo;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Turn state, for tracing and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingResponse,
    Parsing,
    Validating,
    Applying,
    Committing,
    Sealed,
}

/// Files the coder may read and edit, disjoint by intent: `editable` content
/// is injected and mutable, `read_only` content is injected but protected,
/// and everything else in the repo is referenced by path only.
#[derive(Debug, Default)]
pub struct FileSet {
    editable: BTreeSet<PathBuf>,
    read_only: BTreeSet<PathBuf>,
}

impl FileSet {
    pub fn add_editable(&mut self, rel: PathBuf) {
        self.read_only.remove(&rel);
        self.editable.insert(rel);
    }

    pub fn add_read_only(&mut self, rel: PathBuf) {
        self.editable.remove(&rel);
        self.read_only.insert(rel);
    }

    pub fn drop_file(&mut self, rel: &Path) {
        self.editable.remove(rel);
        self.read_only.remove(rel);
    }

    pub fn is_editable(&self, rel: &Path) -> bool {
        self.editable.contains(rel)
    }

    pub fn is_read_only(&self, rel: &Path) -> bool {
        self.read_only.contains(rel)
    }

    pub fn editable(&self) -> impl Iterator<Item = &PathBuf> {
        self.editable.iter()
    }

    pub fn read_only(&self) -> impl Iterator<Item = &PathBuf> {
        self.read_only.iter()
    }
}

/// Per-coder policy, read at turn start.
#[derive(Debug, Clone)]
pub struct CoderConfig {
    pub edit_format: EditFormat,
    pub auto_commit: bool,
    pub max_repair_attempts: usize,
    pub overflow_policy: OverflowPolicy,
    pub run_checks: bool,
    /// Allow edits that create files not yet in the chat.
    pub allow_new_files: bool,
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            edit_format: EditFormat::default(),
            auto_commit: true,
            max_repair_attempts: 3,
            overflow_policy: OverflowPolicy::default(),
            run_checks: false,
            allow_new_files: true,
        }
    }
}

pub struct Coder {
    repo: Arc<GitRepo>,
    model: Arc<dyn ModelClient>,
    history: ChatHistory,
    files: FileSet,
    config: CoderConfig,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl Coder {
    pub fn new(repo: Arc<GitRepo>, model: Arc<dyn ModelClient>, config: CoderConfig) -> Self {
        Self {
            repo,
            model,
            history: ChatHistory::new(),
            files: FileSet::default(),
            config,
            progress: None,
        }
    }

    /// Attach a progress channel; events flow during `submit`.
    pub fn with_progress(mut self, sender: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn edit_format(&self) -> EditFormat {
        self.config.edit_format
    }

    /// Switch the edit protocol. Conversation and file set carry over;
    /// parsing is stateless so there are no buffers to discard.
    pub fn set_edit_format(&mut self, format: EditFormat) {
        tracing::debug!(from = self.config.edit_format.name(), to = format.name(), "switching edit format");
        self.config.edit_format = format;
    }

    /// Add a file to the chat. Read-only-spec matches land in the protected
    /// set regardless of what the caller asked for.
    pub fn add_file(&mut self, path: &Path) -> Result<(), CoderError> {
        let rel = self.repo.normalize_path(path);
        if self.repo.is_ignored(&rel) {
            return Err(CoderError::Parse {
                path: Some(rel),
                reason: "file is excluded by .quillignore".into(),
            });
        }
        if self.repo.is_readonly(&rel) {
            self.files.add_read_only(rel);
        } else {
            self.files.add_editable(rel);
        }
        Ok(())
    }

    pub fn add_read_only_file(&mut self, path: &Path) {
        let rel = self.repo.normalize_path(path);
        self.files.add_read_only(rel);
    }

    pub fn drop_file(&mut self, path: &Path) {
        let rel = self.repo.normalize_path(path);
        self.files.drop_file(&rel);
    }

    /// Abandon the in-progress turn, e.g. after cancelling mid-request.
    /// Applied edits (the point of no return) are never rolled back.
    pub fn abandon_turn(&mut self) {
        self.history.abandon_turn();
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(event);
        }
    }

    /// Drive one full turn: send the conversation, parse and validate the
    /// response, apply edits, commit, and seal. Recoverable failures loop
    /// back with a corrective message up to the configured attempt budget.
    pub async fn submit(&mut self, user_message: &str) -> Result<TurnReport, CoderError> {
        // React to read-only spec changes before the turn begins.
        if let Ok(removed) = self.repo.refresh_readonly() {
            for rel in removed {
                if self.files.is_read_only(&rel) {
                    tracing::debug!(path = %rel.display(), "no longer read-only");
                    self.files.drop_file(&rel);
                    self.files.add_editable(rel);
                }
            }
        }

        self.history.append_user(user_message);

        let mut usage = Usage::default();
        let mut transcript: Vec<String> = Vec::new();
        let max_attempts = self.config.max_repair_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut phase = Phase::AwaitingResponse;
            tracing::debug!(attempt, ?phase, "requesting completion");

            let messages = self.render_messages()?;
            match ChatHistory::check_window(&messages, self.model.as_ref(), self.config.overflow_policy)
            {
                Ok(None) => {}
                Ok(Some(tokens)) => {
                    self.emit(ProgressEvent::ContextWarning {
                        tokens,
                        window: self.model.context_window(),
                    });
                }
                Err(err) => {
                    self.history.abandon_turn();
                    return Err(err);
                }
            }

            let response = {
                let emit_chunk = |chunk: &str| {
                    if let Some(sender) = &self.progress {
                        let _ = sender.send(ProgressEvent::Chunk(chunk.to_string()));
                    }
                };
                match self.model.complete(&messages, Some(&emit_chunk)).await {
                    Ok(response) => response,
                    Err(err) => {
                        self.history.abandon_turn();
                        return Err(CoderError::Model(err));
                    }
                }
            };
            if let Some(delta) = &response.usage {
                usage.absorb(delta);
                self.emit(ProgressEvent::Usage(delta.clone()));
            }
            self.history.append_assistant(&response.content);

            phase = Phase::Parsing;
            tracing::debug!(attempt, ?phase, "parsing response");
            let parsed = self.config.edit_format.parse(&response.content);

            let plan = match parsed {
                Ok(edits) => {
                    phase = Phase::Validating;
                    tracing::debug!(attempt, ?phase, edits = edits.len(), "validating edits");
                    self.validate_and_plan(&edits)
                }
                Err(err) => Err(err),
            };

            let plan = match plan {
                Ok(plan) => plan,
                Err(err) if err.is_repairable() && attempt < max_attempts => {
                    let corrective = err.corrective_message();
                    self.emit(ProgressEvent::RepairAttempt {
                        attempt: attempt + 1,
                        max: max_attempts,
                        reason: err.to_string(),
                    });
                    tracing::debug!(attempt, "repairable failure: {err}");
                    transcript.push(corrective.clone());
                    self.history.append_user(&corrective);
                    continue;
                }
                Err(err) if err.is_repairable() => {
                    transcript.push(err.corrective_message());
                    self.history.abandon_turn();
                    return Err(CoderError::RetriesExhausted {
                        attempts: attempt,
                        last_failure: err.to_string(),
                        transcript,
                    });
                }
                Err(err) => {
                    self.history.abandon_turn();
                    return Err(err);
                }
            };

            // Apply + commit is the critical section; one exclusive lock per
            // repository root serializes concurrent coders.
            let mut outcomes = Vec::new();
            let mut commit = None;
            if !plan.is_empty() {
                phase = Phase::Applying;
                tracing::debug!(attempt, ?phase, files = plan.len(), "writing edits");
                let _lock = RepoLock::acquire(self.repo.root())
                    .map_err(|e| CoderError::CommitFailure(format!("{e:#}")))?;

                outcomes = edits::write_planned(self.repo.root(), &plan);
                for (path, outcome) in &outcomes {
                    self.emit(ProgressEvent::FileApplied {
                        path: path.clone(),
                        outcome: outcome.clone(),
                    });
                    if outcome.is_applied() && !self.files.is_editable(path) {
                        self.files.add_editable(path.clone());
                    }
                }

                let applied: Vec<PathBuf> = outcomes
                    .iter()
                    .filter(|(_, o)| o.is_applied())
                    .map(|(p, _)| p.clone())
                    .collect();

                if self.config.auto_commit && !applied.is_empty() {
                    phase = Phase::Committing;
                    tracing::debug!(attempt, ?phase, "committing applied files");
                    commit = self.commit_applied(&applied).await?;
                    if let Some(record) = &commit {
                        self.emit(ProgressEvent::Committed(record.clone()));
                    }
                }
            }

            // Post-apply checks feed the repair loop like any other
            // recoverable failure.
            let any_applied = outcomes.iter().any(|(_, o)| o.is_applied());
            if self.config.run_checks && any_applied {
                let results = checks::run(self.repo.root());
                if let Some(report) = checks::failure_report(&results) {
                    for result in results.iter().filter(|r| r.failed()) {
                        self.emit(ProgressEvent::CheckFailed {
                            name: result.name.clone(),
                            output: result.output.clone(),
                        });
                    }
                    if attempt < max_attempts {
                        self.emit(ProgressEvent::RepairAttempt {
                            attempt: attempt + 1,
                            max: max_attempts,
                            reason: "post-apply checks failed".into(),
                        });
                        transcript.push(report.clone());
                        self.history.append_user(&report);
                        continue;
                    }
                    transcript.push(report);
                    self.history.seal_turn();
                    return Err(CoderError::RetriesExhausted {
                        attempts: attempt,
                        last_failure: "post-apply checks failed".into(),
                        transcript,
                    });
                }
            }

            phase = Phase::Sealed;
            tracing::debug!(attempt, ?phase, "turn complete");
            self.history.seal_turn();
            return Ok(TurnReport {
                turn_id: Uuid::new_v4(),
                completed_at: Utc::now(),
                response: response.content,
                files: outcomes,
                commit,
                usage,
                attempts: attempt,
            });
        }

        unreachable!("attempt loop always returns");
    }

    fn render_messages(&self) -> Result<Vec<Message>, CoderError> {
        let mut context = FileContext::default();
        for rel in self.files.read_only() {
            context
                .read_only
                .push((rel.clone(), self.read_file(rel)));
        }
        for rel in self.files.editable() {
            context.editable.push((rel.clone(), self.read_file(rel)));
        }
        let format = self.config.edit_format;
        Ok(self.history.render_for_model(
            format.system_prompt(),
            &format.example_messages(),
            &context,
        ))
    }

    fn read_file(&self, rel: &Path) -> String {
        std::fs::read_to_string(self.repo.abs_path(rel)).unwrap_or_default()
    }

    /// Validation: every target is editable or a permitted new file, nothing
    /// targets a read-only path, and every search/context region resolves to
    /// exactly one location (checked by dry-running the content transform).
    fn validate_and_plan(
        &self,
        parsed: &[Edit],
    ) -> Result<Vec<edits::PlannedWrite>, CoderError> {
        for edit in parsed {
            let rel = &edit.path;
            if self.files.is_read_only(rel) || self.repo.is_readonly(rel) {
                return Err(CoderError::ReadOnlyViolation { path: rel.clone() });
            }
            if self.files.is_editable(rel) {
                continue;
            }
            let plausible_new = edit.creates_file()
                && self.config.allow_new_files
                && !self.repo.is_ignored(rel)
                && !self.repo.abs_path(rel).exists();
            if !plausible_new {
                return Err(CoderError::Parse {
                    path: Some(rel.clone()),
                    reason: "file is not in the chat; add it first or create it as a new file"
                        .into(),
                });
            }
        }
        edits::plan_edits(self.repo.root(), parsed)
    }

    async fn commit_applied(
        &self,
        applied: &[PathBuf],
    ) -> Result<Option<CommitRecord>, CoderError> {
        self.repo.commit(applied, None, None, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Message;
    use crate::ignorespec::READONLY_FILE;
    use crate::model::{ChunkSink, LlmResponse};
    use crate::protocol::FileOutcome;
    use anyhow::Result as AnyResult;
    use git2::{Repository, Signature};
    use std::fs;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Plays back canned responses and records every transcript it receives.
    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        received: Mutex<Vec<Vec<Message>>>,
        window: usize,
    }

    impl ScriptedModel {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                received: Mutex::new(Vec::new()),
                window: 1_000_000,
            })
        }

        fn last_user_message(&self) -> String {
            let received = self.received.lock().unwrap();
            let transcript = received.last().expect("no requests recorded");
            transcript
                .iter()
                .rev()
                .find(|m| m.role == crate::chat::Role::User)
                .map(|m| m.content.as_text())
                .unwrap_or_default()
        }

        fn request_count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        fn context_window(&self) -> usize {
            self.window
        }

        fn token_count(&self, messages: &[Message]) -> usize {
            messages
                .iter()
                .map(|m| m.content.as_text().len() / 4)
                .sum()
        }

        fn complete<'a>(
            &'a self,
            messages: &'a [Message],
            _on_chunk: Option<ChunkSink<'a>>,
        ) -> Pin<Box<dyn Future<Output = AnyResult<LlmResponse>> + Send + 'a>> {
            Box::pin(async move {
                self.received.lock().unwrap().push(messages.to_vec());
                let response = self
                    .responses
                    .lock()
                    .unwrap()
                    .pop()
                    .expect("scripted model ran out of responses");
                Ok(LlmResponse {
                    content: response,
                    usage: Some(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                        cost: Some(0.001),
                    }),
                })
            })
        }
    }

    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().canonicalize().unwrap();
        Repository::init(&repo_path).expect("Failed to init repo");
        let repo = Repository::open(&repo_path).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        (temp_dir, repo_path)
    }

    fn commit_file(repo_path: &Path, rel: &str, content: &str) {
        let full = repo_path.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();

        let repo = Repository::open(repo_path).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        match parent {
            Some(ref p) => repo
                .commit(Some("HEAD"), &sig, &sig, "setup", &tree, &[p])
                .unwrap(),
            None => repo
                .commit(Some("HEAD"), &sig, &sig, "setup", &tree, &[])
                .unwrap(),
        };
    }

    fn make_coder(repo_path: &Path, model: Arc<ScriptedModel>, config: CoderConfig) -> Coder {
        let repo = Arc::new(
            GitRepo::discover(
                &[repo_path.to_path_buf()],
                crate::repo::Attribution::default(),
                None,
            )
            .unwrap(),
        );
        Coder::new(repo, model, config)
    }

    const GOOD_EDIT: &str = "\
a.py
<<<<<<< SEARCH
def f(): pass
=======
def f(): return 1
>>>>>>> REPLACE
";

    #[tokio::test]
    async fn test_submit_applies_edit_and_commits_with_attribution() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let model = ScriptedModel::new(&[GOOD_EDIT]);
        let mut coder = make_coder(&repo_path, model, CoderConfig::default());
        coder.add_file(Path::new("a.py")).unwrap();

        let report = coder.submit("make f return 1").await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(
            fs::read_to_string(repo_path.join("a.py")).unwrap(),
            "def f(): return 1\n"
        );
        let commit = report.commit.expect("auto-commit expected");
        assert!(commit.attributed);

        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.committer().name(), Some("Test User (quill)"));
    }

    #[tokio::test]
    async fn test_repair_loop_recovers_from_parse_error() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let malformed = "a.py\n<<<<<<< SEARCH\ndef f(): pass\n>>>>>>> REPLACE\n";
        let model = ScriptedModel::new(&[malformed, GOOD_EDIT]);
        let mut coder = make_coder(&repo_path, Arc::clone(&model), CoderConfig::default());
        coder.add_file(Path::new("a.py")).unwrap();

        let report = coder.submit("make f return 1").await.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(model.request_count(), 2);
        // The second request carried a corrective message about the failure.
        let corrective = model.last_user_message();
        assert!(corrective.contains("could not be parsed"), "{corrective}");
        assert_eq!(
            fs::read_to_string(repo_path.join("a.py")).unwrap(),
            "def f(): return 1\n"
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_transcript() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let malformed = "a.py\n<<<<<<< SEARCH\ndef f(): pass\n>>>>>>> REPLACE\n";
        let model = ScriptedModel::new(&[malformed, malformed]);
        let config = CoderConfig {
            max_repair_attempts: 2,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, model, config);
        coder.add_file(Path::new("a.py")).unwrap();

        let err = coder.submit("make f return 1").await.unwrap_err();
        match err {
            CoderError::RetriesExhausted {
                attempts,
                transcript,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(transcript.len(), 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Nothing was applied.
        assert_eq!(
            fs::read_to_string(repo_path.join("a.py")).unwrap(),
            "def f(): pass\n"
        );
        assert!(!coder.history().has_open_turn());
    }

    #[tokio::test]
    async fn test_readonly_violation_repairs_and_leaves_file_untouched() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");
        commit_file(&repo_path, "locked.py", "KEY = 1\n");
        fs::write(repo_path.join(READONLY_FILE), "locked.py\n").unwrap();

        let forbidden = "\
locked.py
<<<<<<< SEARCH
KEY = 1
=======
KEY = 2
>>>>>>> REPLACE
";
        let model = ScriptedModel::new(&[forbidden, GOOD_EDIT]);
        let mut coder = make_coder(&repo_path, Arc::clone(&model), CoderConfig::default());
        coder.add_file(Path::new("a.py")).unwrap();
        coder.add_file(Path::new("locked.py")).unwrap();
        assert!(coder.files().is_read_only(Path::new("locked.py")));

        let report = coder.submit("bump the key").await.unwrap();
        assert_eq!(report.attempts, 2);
        assert!(model.last_user_message().contains("read-only"));

        // The protected file is untouched on disk.
        assert_eq!(
            fs::read_to_string(repo_path.join("locked.py")).unwrap(),
            "KEY = 1\n"
        );
    }

    #[tokio::test]
    async fn test_ambiguous_search_is_validation_failure() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "x = 1\ny = 2\nx = 1\n");

        let ambiguous = "\
a.py
<<<<<<< SEARCH
x = 1
=======
x = 9
>>>>>>> REPLACE
";
        let model = ScriptedModel::new(&[ambiguous]);
        let config = CoderConfig {
            max_repair_attempts: 1,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, model, config);
        coder.add_file(Path::new("a.py")).unwrap();

        let err = coder.submit("set x to 9").await.unwrap_err();
        match err {
            CoderError::RetriesExhausted { last_failure, .. } => {
                assert!(last_failure.contains("ambiguous"), "{last_failure}");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Never silently applied to the first occurrence.
        assert_eq!(
            fs::read_to_string(repo_path.join("a.py")).unwrap(),
            "x = 1\ny = 2\nx = 1\n"
        );
    }

    #[tokio::test]
    async fn test_new_file_creation_joins_editable_set() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let new_file = "\
src/fresh.py
<<<<<<< SEARCH
=======
print(\"fresh\")
>>>>>>> REPLACE
";
        let model = ScriptedModel::new(&[new_file]);
        let mut coder = make_coder(&repo_path, model, CoderConfig::default());

        let report = coder.submit("create fresh.py").await.unwrap();
        assert_eq!(
            report.files[0].1,
            FileOutcome::Applied { created: true }
        );
        assert_eq!(
            fs::read_to_string(repo_path.join("src/fresh.py")).unwrap(),
            "print(\"fresh\")\n"
        );
        assert!(coder.files().is_editable(Path::new("src/fresh.py")));
    }

    #[tokio::test]
    async fn test_unknown_file_without_creation_is_repairable() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        // Non-empty search against a file never added to the chat.
        let stray = "\
other.py
<<<<<<< SEARCH
something
=======
else
>>>>>>> REPLACE
";
        let model = ScriptedModel::new(&[stray]);
        let config = CoderConfig {
            max_repair_attempts: 1,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, model, config);
        coder.add_file(Path::new("a.py")).unwrap();

        let err = coder.submit("edit other").await.unwrap_err();
        assert!(matches!(err, CoderError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn test_none_format_is_conversational() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let model = ScriptedModel::new(&["The function f currently does nothing."]);
        let config = CoderConfig {
            edit_format: EditFormat::None,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, model, config);
        coder.add_file(Path::new("a.py")).unwrap();

        let report = coder.submit("what does f do?").await.unwrap();
        assert!(report.files.is_empty());
        assert!(report.commit.is_none());
        assert!(report.response.contains("does nothing"));
        assert_eq!(coder.history().done_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_commit_disabled_leaves_tree_dirty() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let model = ScriptedModel::new(&[GOOD_EDIT]);
        let config = CoderConfig {
            auto_commit: false,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, model, config);
        coder.add_file(Path::new("a.py")).unwrap();

        let report = coder.submit("make f return 1").await.unwrap();
        assert!(report.commit.is_none());

        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("setup"));
    }

    #[tokio::test]
    async fn test_strict_overflow_refuses_to_send() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let model = Arc::new(ScriptedModel {
            responses: Mutex::new(vec![GOOD_EDIT.to_string()]),
            received: Mutex::new(Vec::new()),
            window: 1,
        });
        let config = CoderConfig {
            overflow_policy: OverflowPolicy::Strict,
            ..CoderConfig::default()
        };
        let mut coder = make_coder(&repo_path, Arc::clone(&model), config);
        coder.add_file(Path::new("a.py")).unwrap();

        let err = coder.submit("make f return 1").await.unwrap_err();
        assert!(matches!(err, CoderError::ContextOverflow { .. }));
        assert_eq!(model.request_count(), 0);
        assert!(!coder.history().has_open_turn());
    }

    #[tokio::test]
    async fn test_progress_events_flow_in_order() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");

        let model = ScriptedModel::new(&[GOOD_EDIT]);
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let mut coder =
            make_coder(&repo_path, model, CoderConfig::default()).with_progress(sender);
        coder.add_file(Path::new("a.py")).unwrap();

        coder.submit("make f return 1").await.unwrap();

        let mut events: Vec<ProgressEvent> = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        let applied_idx = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::FileApplied { .. }))
            .expect("FileApplied event");
        let commit_idx = events
            .iter()
            .position(|e| matches!(e, ProgressEvent::Committed(_)))
            .expect("Committed event");
        assert!(applied_idx < commit_idx);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_coders_serialize_apply_and_commit() {
        let (_tmp, repo_path) = create_temp_repo();
        commit_file(&repo_path, "a.py", "def f(): pass\n");
        commit_file(&repo_path, "b.py", "def g(): pass\n");

        let edit_b = "\
b.py
<<<<<<< SEARCH
def g(): pass
=======
def g(): return 2
>>>>>>> REPLACE
";

        let model_a = ScriptedModel::new(&[GOOD_EDIT]);
        let model_b = ScriptedModel::new(&[edit_b]);

        let mut coder_a = make_coder(&repo_path, model_a, CoderConfig::default());
        coder_a.add_file(Path::new("a.py")).unwrap();
        let mut coder_b = make_coder(&repo_path, model_b, CoderConfig::default());
        coder_b.add_file(Path::new("b.py")).unwrap();

        let task_a = tokio::spawn(async move { coder_a.submit("edit a").await });
        let task_b = tokio::spawn(async move { coder_b.submit("edit b").await });

        let report_a = task_a.await.unwrap().unwrap();
        let report_b = task_b.await.unwrap().unwrap();
        assert!(report_a.commit.is_some());
        assert!(report_b.commit.is_some());

        // Both edits landed intact; one fully-applied turn followed the other.
        assert_eq!(
            fs::read_to_string(repo_path.join("a.py")).unwrap(),
            "def f(): return 1\n"
        );
        assert_eq!(
            fs::read_to_string(repo_path.join("b.py")).unwrap(),
            "def g(): return 2\n"
        );
        let repo = Repository::open(&repo_path).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.parent_count(), 1);
    }
}
