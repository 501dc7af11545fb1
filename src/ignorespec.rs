//! Hot-reloaded pattern specs (.quillignore / .quill_readonly)
//!
//! Each spec file holds gitignore-syntax patterns and may change while quill
//! runs. The cache stores the last-seen mtime alongside the compiled matcher
//! and refreshes at most once per second; a refresh builds a fresh matcher
//! and swaps it in as an `Arc` snapshot, so concurrent readers never observe
//! a half-updated spec.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Name of the per-repo ignore spec.
pub const IGNORE_FILE: &str = ".quillignore";
/// Name of the per-repo read-only spec.
pub const READONLY_FILE: &str = ".quill_readonly";

/// Minimum interval between stat() checks of the backing file.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct SpecState {
    last_check: Option<Instant>,
    mtime: Option<SystemTime>,
    matcher: Option<Arc<Gitignore>>,
    /// Paths matched at the last recompute, for removed-path deltas.
    prev_matches: HashSet<PathBuf>,
}

/// Cache-with-invalidation-token around one pattern file.
pub struct SpecCache {
    root: PathBuf,
    spec_path: PathBuf,
    state: Mutex<SpecState>,
}

impl SpecCache {
    pub fn new(repo_root: &Path, file_name: &str) -> Self {
        Self {
            root: repo_root.to_path_buf(),
            spec_path: repo_root.join(file_name),
            state: Mutex::new(SpecState::default()),
        }
    }

    pub fn spec_path(&self) -> &Path {
        &self.spec_path
    }

    /// Whether `rel_path` (repo-relative) matches the spec. Missing or empty
    /// spec files match nothing.
    pub fn is_match(&self, rel_path: &Path) -> bool {
        match self.snapshot() {
            Some(matcher) => matcher
                .matched_path_or_any_parents(rel_path, false)
                .is_ignore(),
            None => false,
        }
    }

    /// Current matcher snapshot, refreshing from disk if the check interval
    /// has elapsed and the file's mtime moved.
    pub fn snapshot(&self) -> Option<Arc<Gitignore>> {
        let mut state = self.state.lock().unwrap();
        self.refresh_if_stale(&mut state);
        state.matcher.clone()
    }

    /// Force a refresh regardless of the check interval. Returns true when
    /// the compiled matcher changed.
    pub fn refresh_now(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.last_check = None;
        self.refresh_if_stale(&mut state)
    }

    /// Recompute which of `candidates` match the spec and return the paths
    /// that stopped matching since the previous recompute. The coordinator
    /// uses this to drop files from read-only tracking when the spec shrinks.
    pub fn removed_matches(&self, candidates: &[PathBuf]) -> Vec<PathBuf> {
        let mut state = self.state.lock().unwrap();
        self.refresh_if_stale(&mut state);

        let current: HashSet<PathBuf> = match &state.matcher {
            Some(matcher) => candidates
                .iter()
                .filter(|p| matcher.matched_path_or_any_parents(p, false).is_ignore())
                .cloned()
                .collect(),
            None => HashSet::new(),
        };

        let removed: Vec<PathBuf> = state
            .prev_matches
            .difference(&current)
            .cloned()
            .collect();
        state.prev_matches = current;
        removed
    }

    fn refresh_if_stale(&self, state: &mut SpecState) -> bool {
        let now = Instant::now();
        if let Some(last) = state.last_check {
            if now.duration_since(last) < REFRESH_INTERVAL {
                return false;
            }
        }
        state.last_check = Some(now);

        let mtime = match fs::metadata(&self.spec_path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => {
                // Spec file absent: clear the matcher.
                let had = state.matcher.is_some();
                state.matcher = None;
                state.mtime = None;
                return had;
            }
        };

        if state.mtime == Some(mtime) {
            return false;
        }
        state.mtime = Some(mtime);

        let mut builder = GitignoreBuilder::new(&self.root);
        if let Some(err) = builder.add(&self.spec_path) {
            tracing::warn!(
                "failed to read {}: {err}; keeping previous patterns",
                self.spec_path.display()
            );
            return false;
        }
        match builder.build() {
            Ok(matcher) => {
                tracing::debug!("reloaded {}", self.spec_path.display());
                state.matcher = Some(Arc::new(matcher));
                true
            }
            Err(err) => {
                tracing::warn!(
                    "failed to compile {}: {err}; keeping previous patterns",
                    self.spec_path.display()
                );
                false
            }
        }
    }
}

const DEFAULT_IGNORE: &str = "\
# Default .quillignore file
# Patterns for files and directories quill should not read or edit

.git/
target/
node_modules/
__pycache__/

# Large binary artifacts
*.zip
*.tar.gz

# Sensitive information
.env
secrets.json
";

const DEFAULT_READONLY: &str = "\
# .quill_readonly file
# Patterns for files quill may read for context but must never edit
#
# Examples:
# docs/
# Cargo.lock
# *.generated.rs
";

/// Write commented starter spec files when they do not already exist.
pub fn ensure_default_spec_files(repo_root: &Path) -> std::io::Result<()> {
    let ignore_path = repo_root.join(IGNORE_FILE);
    if !ignore_path.exists() {
        fs::write(&ignore_path, DEFAULT_IGNORE)?;
    }
    let readonly_path = repo_root.join(READONLY_FILE);
    if !readonly_path.exists() {
        fs::write(&readonly_path, DEFAULT_READONLY)?;
    }
    Ok(())
}
