//! In-memory stand-in for [`Git`] used by cache and daemon tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::git::{Git, GitError, PullSummary};
use crate::types::normalize_url;

#[derive(Debug, Clone)]
pub(crate) struct FakeRemote {
    pub branches: Vec<String>,
    /// Branch advertised by `ls-remote --symref`; `None` hides it.
    pub default_branch: Option<String>,
    pub head_commit: String,
}

/// Records calls and materialises a minimal `.git` on clone.
///
/// A "clone" writes `.git/HEAD`, and stores the commit and origin URL under
/// `.git/` so the local read operations can answer from disk.
#[derive(Default)]
pub(crate) struct FakeGit {
    remotes: Mutex<HashMap<String, FakeRemote>>,
    clone_delay: Duration,
    pub clones: AtomicUsize,
    pub fetches: AtomicUsize,
    pub pulls: AtomicUsize,
    pub remote_queries: AtomicUsize,
    pub fail_pull: AtomicBool,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clone_delay(mut self, delay: Duration) -> Self {
        self.clone_delay = delay;
        self
    }

    pub fn with_remote(self, url: &str, branches: &[&str], default_branch: Option<&str>) -> Self {
        self.add_remote(url, branches, default_branch);
        self
    }

    pub fn add_remote(&self, url: &str, branches: &[&str], default_branch: Option<&str>) {
        let remote = FakeRemote {
            branches: branches.iter().map(|b| b.to_string()).collect(),
            default_branch: default_branch.map(str::to_string),
            head_commit: "1111111111111111111111111111111111111111".to_string(),
        };
        self.remotes
            .lock()
            .unwrap()
            .insert(Self::key(url), remote);
    }

    /// Move the remote's head, as if someone pushed.
    pub fn push_commit(&self, url: &str, commit: &str) {
        if let Some(remote) = self.remotes.lock().unwrap().get_mut(&Self::key(url)) {
            remote.head_commit = commit.to_string();
        }
    }

    fn key(url: &str) -> String {
        normalize_url(url).unwrap_or_else(|_| url.to_string())
    }

    fn remote(&self, url: &str) -> Option<FakeRemote> {
        self.remotes.lock().unwrap().get(&Self::key(url)).cloned()
    }

    fn read_git_file(repo: &Path, name: &str) -> Result<String, GitError> {
        fs::read_to_string(repo.join(".git").join(name))
            .map(|s| s.trim().to_string())
            .map_err(|_| GitError::NotFound(repo.display().to_string()))
    }
}

impl Git for FakeGit {
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        _depth: u32,
        branch: Option<&str>,
    ) -> Result<(), GitError> {
        std::thread::sleep(self.clone_delay);
        self.clones.fetch_add(1, Ordering::SeqCst);

        let remote = self
            .remote(url)
            .ok_or_else(|| GitError::CloneError(format!("repository '{url}' not found")))?;

        let branch = match branch {
            Some(b) if remote.branches.iter().any(|known| known == b) => b.to_string(),
            Some(b) => return Err(GitError::BranchNotFound(b.to_string())),
            None => remote
                .default_branch
                .clone()
                .or_else(|| remote.branches.first().cloned())
                .ok_or_else(|| GitError::CloneError("empty repository".into()))?,
        };

        let git_dir = dest.join(".git");
        fs::create_dir_all(&git_dir)?;
        fs::write(git_dir.join("HEAD"), format!("ref: refs/heads/{branch}\n"))?;
        fs::write(git_dir.join("FAKE_COMMIT"), &remote.head_commit)?;
        fs::write(git_dir.join("FAKE_ORIGIN"), url)?;
        fs::write(dest.join("README.md"), "# widgets\n")?;
        fs::create_dir_all(dest.join("src"))?;
        fs::write(dest.join("src").join("lib.rs"), "pub fn answer() -> u32 { 42 }\n")?;
        Ok(())
    }

    fn fetch(&self, _repo: &Path) -> Result<(), GitError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pull(&self, repo: &Path, _remote: &str, _branch: &str) -> Result<PullSummary, GitError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(GitError::PullError("simulated network failure".into()));
        }

        let origin = Self::read_git_file(repo, "FAKE_ORIGIN")?;
        let remote = self
            .remote(&origin)
            .ok_or_else(|| GitError::PullError("remote vanished".into()))?;
        let current = Self::read_git_file(repo, "FAKE_COMMIT")?;

        if current == remote.head_commit {
            return Ok(PullSummary::default());
        }
        fs::write(repo.join(".git").join("FAKE_COMMIT"), &remote.head_commit)?;
        Ok(PullSummary { files_changed: 1 })
    }

    fn clean(&self, _repo: &Path, _keep: &[&str]) -> Result<(), GitError> {
        Ok(())
    }

    fn latest_commit(&self, repo: &Path) -> Result<String, GitError> {
        Self::read_git_file(repo, "FAKE_COMMIT")
    }

    fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError> {
        let head = Self::read_git_file(repo, "HEAD")?;
        Ok(head.strip_prefix("ref: refs/heads/").map(str::to_string))
    }

    fn remote_url(&self, repo: &Path, remote: &str) -> Result<Option<String>, GitError> {
        if remote != "origin" {
            return Ok(None);
        }
        Ok(Self::read_git_file(repo, "FAKE_ORIGIN").ok())
    }

    fn default_branch(&self, url: &str) -> Result<Option<String>, GitError> {
        self.remote_queries.fetch_add(1, Ordering::SeqCst);
        let remote = self
            .remote(url)
            .ok_or_else(|| GitError::RemoteError("repository not found".into()))?;
        Ok(remote.default_branch)
    }

    fn remote_branch_exists(&self, url: &str, branch: &str) -> Result<bool, GitError> {
        self.remote_queries.fetch_add(1, Ordering::SeqCst);
        let remote = self
            .remote(url)
            .ok_or_else(|| GitError::RemoteError("repository not found".into()))?;
        Ok(remote.branches.iter().any(|b| b == branch))
    }
}
