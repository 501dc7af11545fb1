//! Repository apply lock
//!
//! Two coders sharing one working tree must not interleave their
//! apply+commit critical sections. An advisory exclusive lock on
//! `.quill/repo.lock` serializes them per repository root; acquisition
//! waits with a bounded retry loop and the lock releases on drop.

use anyhow::Result;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

const LOCK_DIR: &str = ".quill";
const LOCK_FILE: &str = "repo.lock";
const LOCK_TIMEOUT_SECS: u64 = 30;
const LOCK_RETRY_MS: u64 = 50;

pub struct RepoLock {
    file: std::fs::File,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl RepoLock {
    /// Acquire the exclusive apply lock for a repository root, waiting up to
    /// the timeout for a competing coder to finish.
    pub fn acquire(repo_root: &Path) -> Result<RepoLock> {
        let dir = repo_root.join(LOCK_DIR);
        fs::create_dir_all(&dir)?;
        let lock_path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for repository lock ({}s); \
                             another quill session may be applying edits",
                            LOCK_TIMEOUT_SECS
                        ));
                    }
                    tracing::debug!("repository lock contended, retrying");
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(RepoLock { file })
    }
}
