//! Repository adapter
//!
//! Wraps version control for the coder: tracked-file enumeration (cached by
//! HEAD commit), unified diff text, dirty-state queries, and attributed
//! commits. Two independent pattern specs ride along: `.quillignore` hides
//! files from quill entirely, `.quill_readonly` marks files quill may read
//! but never edit.
//!
//! Following the rest of the codebase, a `git2::Repository` handle is opened
//! per operation rather than held across calls.

use crate::error::CoderError;
use crate::ignorespec::{SpecCache, IGNORE_FILE, READONLY_FILE};
use crate::model::{generate_commit_message, ModelClient};
use crate::protocol::CommitRecord;
use anyhow::{Context, Result};
use git2::{DiffFormat, DiffOptions, ErrorCode, ObjectType, Oid, Repository, Signature};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Fallback commit message when generation fails or produces nothing.
const PLACEHOLDER_COMMIT_MESSAGE: &str = "(no commit message provided)";

/// Suffix appended to the git identity for tool-attributed commits.
const ATTRIBUTION_SUFFIX: &str = " (quill)";

/// Commit attribution policy.
#[derive(Debug, Clone, Copy)]
pub struct Attribution {
    /// Append the suffix to the committer name on every quill commit.
    pub committer: bool,
    /// Append the suffix to the author name when the commit carries tool edits.
    pub author: bool,
}

impl Default for Attribution {
    fn default() -> Self {
        Self {
            committer: true,
            author: true,
        }
    }
}

pub struct GitRepo {
    root: PathBuf,
    ignore_spec: SpecCache,
    readonly_spec: SpecCache,
    attribution: Attribution,
    commit_model: Option<Arc<dyn ModelClient>>,
    /// HEAD-tree file enumeration, keyed by commit id.
    tree_files: Mutex<HashMap<Oid, Arc<HashSet<PathBuf>>>>,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepo")
            .field("root", &self.root)
            .field("attribution", &self.attribution)
            .field("has_commit_model", &self.commit_model.is_some())
            .finish()
    }
}

impl GitRepo {
    /// Locate the repository containing the candidate paths. Every candidate
    /// must resolve into the same working tree; zero or multiple distinct
    /// repositories is fatal.
    pub fn discover(
        candidates: &[PathBuf],
        attribution: Attribution,
        commit_model: Option<Arc<dyn ModelClient>>,
    ) -> Result<Self, CoderError> {
        let check: Vec<PathBuf> = if candidates.is_empty() {
            vec![PathBuf::from(".")]
        } else {
            candidates.to_vec()
        };

        let mut roots = HashSet::new();
        for candidate in &check {
            let mut probe = candidate.clone();
            if !probe.exists() {
                if let Some(parent) = probe.parent() {
                    if parent.as_os_str().is_empty() {
                        probe = PathBuf::from(".");
                    } else {
                        probe = parent.to_path_buf();
                    }
                }
            }
            if let Ok(repo) = Repository::discover(&probe) {
                if let Some(workdir) = repo.workdir() {
                    if let Ok(canonical) = workdir.canonicalize() {
                        roots.insert(canonical);
                    }
                }
            }
        }

        match roots.len() {
            0 => Err(CoderError::RepositoryUnavailable(
                "no git repository found for the given paths".into(),
            )),
            1 => {
                let root = roots.into_iter().next().unwrap();
                Ok(Self {
                    ignore_spec: SpecCache::new(&root, IGNORE_FILE),
                    readonly_spec: SpecCache::new(&root, READONLY_FILE),
                    root,
                    attribution,
                    commit_model,
                    tree_files: Mutex::new(HashMap::new()),
                })
            }
            n => Err(CoderError::RepositoryUnavailable(format!(
                "files span {} different git repositories",
                n
            ))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.root)
            .with_context(|| format!("Failed to open repository at {}", self.root.display()))
    }

    /// Absolute path for a repo-relative one.
    pub fn abs_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Normalize a path to repo-relative form with forward slashes.
    pub fn normalize_path(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        PathBuf::from(rel.to_string_lossy().replace('\\', "/"))
    }

    pub fn is_ignored(&self, rel: &Path) -> bool {
        self.ignore_spec.is_match(rel)
    }

    pub fn is_readonly(&self, rel: &Path) -> bool {
        self.readonly_spec.is_match(rel)
    }

    /// Tracked files matched by the read-only spec.
    pub fn readonly_files(&self) -> Result<Vec<PathBuf>> {
        let tracked = self.tracked_files()?;
        Ok(tracked
            .into_iter()
            .filter(|p| self.readonly_spec.is_match(p))
            .collect())
    }

    /// Re-evaluate the read-only spec against tracked files and return the
    /// paths that are no longer read-only, so the coordinator can drop them.
    pub fn refresh_readonly(&self) -> Result<Vec<PathBuf>> {
        let tracked = self.tracked_files()?;
        Ok(self.readonly_spec.removed_matches(&tracked))
    }

    /// All files known to version control: HEAD tree plus staged additions,
    /// filtered through the ignore spec. The HEAD enumeration is cached per
    /// commit id and recomputed only when HEAD moves.
    pub fn tracked_files(&self) -> Result<Vec<PathBuf>> {
        let repo = self.open()?;
        let mut files: HashSet<PathBuf> = HashSet::new();

        if let Some(commit) = head_commit_of(&repo)? {
            let mut cache = self.tree_files.lock().unwrap();
            let entry = match cache.get(&commit.id()) {
                Some(cached) => Arc::clone(cached),
                None => {
                    let mut tree_paths = HashSet::new();
                    let tree = commit.tree()?;
                    tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
                        if entry.kind() == Some(ObjectType::Blob) {
                            if let Some(name) = entry.name() {
                                tree_paths.insert(PathBuf::from(format!("{}{}", root, name)));
                            }
                        }
                        git2::TreeWalkResult::Ok
                    })?;
                    let arc = Arc::new(tree_paths);
                    cache.insert(commit.id(), Arc::clone(&arc));
                    arc
                }
            };
            files.extend(entry.iter().cloned());
        }

        let index = repo.index()?;
        for entry in index.iter() {
            if let Ok(path) = String::from_utf8(entry.path.clone()) {
                files.insert(PathBuf::from(path));
            }
        }

        let mut result: Vec<PathBuf> = files
            .into_iter()
            .filter(|p| !self.ignore_spec.is_match(p))
            .collect();
        result.sort();
        Ok(result)
    }

    pub fn path_in_repo(&self, rel: &Path) -> bool {
        self.tracked_files()
            .map(|files| files.iter().any(|p| p == rel))
            .unwrap_or(false)
    }

    /// HEAD commit hash, or None before the first commit.
    pub fn head_commit(&self) -> Option<String> {
        let repo = self.open().ok()?;
        head_commit_of(&repo)
            .ok()
            .flatten()
            .map(|c| c.id().to_string())
    }

    /// Unified diff of index + working tree against HEAD for the given
    /// repo-relative paths (all paths when empty). Untracked paths among the
    /// arguments are reported as `Added <path>` since they have no prior
    /// diff. In a repository with no commits, the diff runs against the
    /// index and working tree directly.
    pub fn diffs(&self, paths: &[PathBuf]) -> Result<String> {
        let repo = self.open()?;
        let mut text = String::new();

        for path in paths {
            if !self.path_in_repo(path) {
                text.push_str(&format!("Added {}\n", path.display()));
            }
        }

        let mut opts = DiffOptions::new();
        for path in paths {
            opts.pathspec(path.to_string_lossy().as_ref());
        }

        match head_commit_of(&repo)? {
            Some(commit) => {
                let tree = commit.tree()?;
                let diff =
                    repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;
                text.push_str(&render_patch(&diff)?);
            }
            None => {
                // Zero-commit repository: index vs empty tree, then working
                // tree vs index.
                let mut index_opts = DiffOptions::new();
                let mut wd_opts = DiffOptions::new();
                for path in paths {
                    index_opts.pathspec(path.to_string_lossy().as_ref());
                    wd_opts.pathspec(path.to_string_lossy().as_ref());
                }
                let staged = repo.diff_tree_to_index(None, None, Some(&mut index_opts))?;
                text.push_str(&render_patch(&staged)?);
                let unstaged = repo.diff_index_to_workdir(None, Some(&mut wd_opts))?;
                text.push_str(&render_patch(&unstaged)?);
            }
        }

        Ok(text)
    }

    /// Files with staged or unstaged modifications, repo-relative.
    pub fn dirty_files(&self) -> Result<Vec<PathBuf>> {
        let repo = self.open()?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(false)
            .include_ignored(false)
            .include_unmodified(false)
            .exclude_submodules(true);

        let statuses = repo.statuses(Some(&mut opts))?;
        let mut dirty = HashSet::new();
        for entry in statuses.iter() {
            let s = entry.status();
            let touched = s.is_index_new()
                || s.is_index_modified()
                || s.is_index_deleted()
                || s.is_wt_modified()
                || s.is_wt_deleted();
            if touched {
                if let Some(path) = entry.path() {
                    dirty.insert(PathBuf::from(path));
                }
            }
        }
        let mut result: Vec<PathBuf> = dirty.into_iter().collect();
        result.sort();
        Ok(result)
    }

    /// Whether the working tree or index differ from HEAD. With a path,
    /// untracked files count as dirty (they need a first commit).
    pub fn is_dirty(&self, path: Option<&Path>) -> bool {
        if let Some(rel) = path {
            if !self.path_in_repo(rel) {
                return true;
            }
        }
        match (self.dirty_files(), path) {
            (Ok(files), Some(rel)) => files.iter().any(|p| p == rel),
            (Ok(files), None) => !files.is_empty(),
            (Err(_), _) => false,
        }
    }

    /// Stage the given repo-relative paths (all dirty files when empty) and
    /// commit, bypassing hooks. Without an explicit message, a commit message
    /// is generated from the diff text; generation failure falls back to a
    /// placeholder and never blocks the commit. Returns None when there is
    /// nothing to commit.
    pub async fn commit(
        &self,
        paths: &[PathBuf],
        message: Option<&str>,
        context: Option<&str>,
        tool_edits: bool,
    ) -> Result<Option<CommitRecord>, CoderError> {
        if paths.is_empty() && !self.is_dirty(None) {
            return Ok(None);
        }

        let diffs = self
            .diffs(paths)
            .map_err(|e| CoderError::CommitFailure(format!("{e:#}")))?;
        if diffs.is_empty() {
            return Ok(None);
        }

        let commit_message = match message {
            Some(m) => m.to_string(),
            None => match &self.commit_model {
                Some(model) => generate_commit_message(model.as_ref(), &diffs, context)
                    .await
                    .unwrap_or_else(|| PLACEHOLDER_COMMIT_MESSAGE.to_string()),
                None => PLACEHOLDER_COMMIT_MESSAGE.to_string(),
            },
        };

        self.commit_staged(paths, &commit_message, tool_edits)
            .map(Some)
            .map_err(|e| CoderError::CommitFailure(format!("{e:#}")))
    }

    fn commit_staged(
        &self,
        paths: &[PathBuf],
        message: &str,
        tool_edits: bool,
    ) -> Result<CommitRecord> {
        let repo = self.open()?;
        let mut index = repo.index()?;

        if paths.is_empty() {
            // Equivalent of `git commit -a`: stage every tracked change.
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
            index.update_all(["*"].iter(), None)?;
        } else {
            for rel in paths {
                if self.abs_path(rel).exists() {
                    index.add_path(rel)?;
                } else {
                    index.remove_path(rel)?;
                }
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let (author, committer, attributed) = self.signatures(&repo, tool_edits)?;

        let parent = head_commit_of(&repo)?;
        let oid = match parent {
            Some(ref parent) => {
                repo.commit(Some("HEAD"), &author, &committer, message, &tree, &[parent])?
            }
            None => repo.commit(Some("HEAD"), &author, &committer, message, &tree, &[])?,
        };

        let hash = oid.to_string()[..7].to_string();
        tracing::debug!(%hash, "created commit");
        Ok(CommitRecord {
            hash,
            message: message.to_string(),
            attributed,
        })
    }

    /// Build author/committer signatures. The base identity comes from git
    /// config, overridden by the standard GIT_AUTHOR_NAME / GIT_COMMITTER_NAME
    /// environment variables when set; the attribution suffix is appended to
    /// the signature itself, so no process-global state changes.
    fn signatures(
        &self,
        repo: &Repository,
        tool_edits: bool,
    ) -> Result<(Signature<'static>, Signature<'static>, bool)> {
        let config = repo.config()?;
        let base_name = config
            .get_string("user.name")
            .unwrap_or_else(|_| "quill".to_string());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| "quill@local".to_string());

        let author_name = std::env::var("GIT_AUTHOR_NAME").unwrap_or_else(|_| base_name.clone());
        let committer_name =
            std::env::var("GIT_COMMITTER_NAME").unwrap_or_else(|_| base_name.clone());

        let attribute_author = tool_edits && self.attribution.author;
        let author = if attribute_author {
            Signature::now(&format!("{}{}", author_name, ATTRIBUTION_SUFFIX), &email)?
        } else {
            Signature::now(&author_name, &email)?
        };
        let committer = if self.attribution.committer {
            Signature::now(&format!("{}{}", committer_name, ATTRIBUTION_SUFFIX), &email)?
        } else {
            Signature::now(&committer_name, &email)?
        };

        Ok((author, committer, attribute_author || self.attribution.committer))
    }
}

fn head_commit_of(repo: &Repository) -> Result<Option<git2::Commit<'_>>> {
    match repo.head() {
        Ok(head) => match head.peel_to_commit() {
            Ok(commit) => Ok(Some(commit)),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        },
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn render_patch(diff: &git2::Diff<'_>) -> Result<String> {
    let mut text = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => text.push(line.origin()),
            _ => {}
        }
        text.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;
    Ok(text)
}
