//! Repository cache manager
//!
//! `RepoCache` resolves a `(url, branch)` request to a local clone. It ties
//! together path resolution, per-entry locking, the metadata sidecar, the
//! staleness gate and the git layer, including the branch fallback chain for
//! branches that do not exist on the remote.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::git::{Git, GitCli, GitError};
use super::limiter::OperationLimiter;
use super::lock::{LockError, LockOptions, RepoLock};
use super::metadata::{self, MetadataError, RepoMetadata, UNKNOWN_COMMIT};
use super::paths::{CachePaths, METADATA_FILE, entry_exists};
use super::redirects::BranchRedirects;
use super::staleness::{self, is_stale};
use super::stats::{self, AggregateStats, EntryStats};
use crate::config::Config;
use crate::types::{CloneMethod, EntryKey, ParseError, RepoUrl};

/// Conventional branch names probed when the remote does not advertise HEAD.
const COMMON_BRANCHES: &[&str] = &["main", "master", "develop", "dev"];

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid repository url: {0}")]
    InvalidUrl(ParseError),
    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),
    /// Clone failed, including every fallback attempt.
    #[error("failed to clone {url}: {source}")]
    CloneFailed {
        url: String,
        #[source]
        source: GitError,
    },
    #[error("failed to update {}: {source}", path.display())]
    UpdateFailed {
        path: PathBuf,
        #[source]
        source: GitError,
    },
    #[error("cache entry not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("could not lock {}: {source}", path.display())]
    LockFailed {
        path: PathBuf,
        #[source]
        source: LockError,
    },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<ParseError> for CacheError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidBranch(branch) => CacheError::InvalidBranch(branch),
            other => CacheError::InvalidUrl(other),
        }
    }
}

impl CacheError {
    /// Machine-readable error code for callers that map errors to a transport.
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::InvalidUrl(_) => "INVALID_URL",
            CacheError::InvalidBranch(_) => "INVALID_BRANCH",
            CacheError::CloneFailed { .. } => "CLONE_FAILED",
            CacheError::UpdateFailed { .. } => "UPDATE_FAILED",
            CacheError::NotFound(_) => "NOT_FOUND",
            CacheError::LockFailed { .. } => "LOCK_FAILED",
            CacheError::Metadata(_) => "METADATA_ERROR",
            CacheError::Storage { .. } => "STORAGE_ERROR",
        }
    }

    fn clone_failed(url: &RepoUrl, source: GitError) -> Self {
        CacheError::CloneFailed {
            url: url.canonical().to_string(),
            source,
        }
    }

    fn storage(path: &Path, source: io::Error) -> Self {
        CacheError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A ready-to-use local clone.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub url: String,
    /// Branch actually checked out; may differ from the one requested.
    pub branch: String,
    pub local_path: PathBuf,
    pub commit_hash: String,
    pub last_updated: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub clone_method: CloneMethod,
}

impl CacheEntry {
    fn from_metadata(local_path: &Path, metadata: RepoMetadata) -> Self {
        Self {
            url: metadata.url,
            branch: metadata.branch,
            local_path: local_path.to_path_buf(),
            commit_hash: metadata.commit_hash,
            last_updated: metadata.last_updated,
            last_accessed: metadata.last_accessed,
            clone_method: metadata.clone_method,
        }
    }
}

/// What `entry_info` knows about an entry without touching it.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub url: RepoUrl,
    pub branch: String,
    pub local_path: PathBuf,
    pub exists: bool,
    pub metadata: Option<RepoMetadata>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOptions {
    /// Delete any existing clone and clone afresh.
    pub force: bool,
}

/// Result of a staleness-gated refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub updated: bool,
    pub previous_hash: String,
    pub current_hash: String,
    pub change_count: u64,
}

impl UpdateOutcome {
    fn unchanged(hash: String) -> Self {
        Self {
            updated: false,
            previous_hash: hash.clone(),
            current_hash: hash,
            change_count: 0,
        }
    }
}

/// Which step of the branch fallback chain produced a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloneStage {
    RequestedBranch,
    DetectedBranch,
    ProbedBranch,
    Unqualified,
}

impl fmt::Display for CloneStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloneStage::RequestedBranch => "requested branch",
            CloneStage::DetectedBranch => "detected default branch",
            CloneStage::ProbedBranch => "probed branch",
            CloneStage::Unqualified => "unqualified clone",
        };
        f.write_str(name)
    }
}

/// A clone attempt either produced a new entry or found one already in place.
enum CloneOutcome {
    Created(CacheEntry),
    Existing(EntryKey),
}

/// Cache manager for git repositories.
pub struct RepoCache {
    paths: CachePaths,
    git: Arc<dyn Git>,
    lock_options: LockOptions,
    clone_depth: u32,
    update_threshold: Duration,
    default_branch: String,
    limiter: OperationLimiter,
    redirects: BranchRedirects,
    staging_max_age: Duration,
}

impl RepoCache {
    /// Create a cache manager backed by the system git.
    pub fn new(config: &Config) -> Result<Self, CacheError> {
        Self::with_git(config, Arc::new(GitCli::new(&config.git)))
    }

    /// Create a cache manager with a custom git implementation.
    pub fn with_git(config: &Config, git: Arc<dyn Git>) -> Result<Self, CacheError> {
        let paths = CachePaths::new(&config.repository.storage_path);
        paths
            .ensure_dirs()
            .map_err(|e| CacheError::storage(paths.storage_root(), e))?;

        Ok(Self {
            paths,
            git,
            lock_options: config.lock.options(),
            clone_depth: config.repository.clone_depth,
            update_threshold: staleness::hours(config.repository.update_threshold_hours),
            default_branch: config.repository.default_branch.clone(),
            limiter: OperationLimiter::new(config.repository.max_concurrent_operations),
            redirects: BranchRedirects::new(),
            staging_max_age: Duration::from_secs(
                config.git.timeout_secs + config.git.termination_grace_secs,
            ),
        })
    }

    /// Return the cache paths used by this cache manager.
    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// Staging directories older than this belong to a clone that can no
    /// longer be running.
    pub fn staging_max_age(&self) -> Duration {
        self.staging_max_age
    }

    /// Ensure a clone of `url` at `branch` (default branch if `None`) exists,
    /// refreshing it first when stale.
    pub fn ensure_entry(&self, url: &str, branch: Option<&str>) -> Result<CacheEntry, CacheError> {
        self.ensure_entry_with(url, branch, EnsureOptions::default())
    }

    pub fn ensure_entry_with(
        &self,
        url: &str,
        branch: Option<&str>,
        options: EnsureOptions,
    ) -> Result<CacheEntry, CacheError> {
        let repo_url = RepoUrl::parse(url)?;
        let requested = branch.unwrap_or(&self.default_branch);

        let branch = if options.force {
            self.redirects.forget(repo_url.canonical(), requested);
            requested.to_string()
        } else {
            self.redirects
                .resolve(repo_url.canonical(), requested)
                .unwrap_or_else(|| requested.to_string())
        };
        let key = EntryKey::new(&repo_url, &branch)?;
        let entry_dir = self.paths.entry_dir(&key);

        if options.force || !entry_exists(&entry_dir) {
            return self.clone_entry(&repo_url, &key, options.force);
        }
        self.open_existing(&repo_url, &key, &entry_dir)
    }

    /// Clone the entry for `key`, or reclone it when `force` is set.
    ///
    /// If another caller finished the clone while this one waited for the
    /// lock, the existing entry is returned instead.
    pub fn clone_entry(
        &self,
        url: &RepoUrl,
        key: &EntryKey,
        force: bool,
    ) -> Result<CacheEntry, CacheError> {
        let entry_dir = self.paths.entry_dir(key);

        let outcome = {
            let _lock = self.lock_entry(&entry_dir)?;
            if force {
                self.clone_locked(url, key, &entry_dir)?
            } else if entry_exists(&entry_dir) {
                log::debug!("{} was cloned while waiting for its lock", key);
                CloneOutcome::Existing(key.clone())
            } else if let Some(actual) = self.redirected_entry(url, key) {
                log::debug!("{} was redirected to {} while waiting for its lock", key, actual);
                CloneOutcome::Existing(actual)
            } else {
                self.clone_locked(url, key, &entry_dir)?
            }
        };

        match outcome {
            CloneOutcome::Created(entry) => Ok(entry),
            CloneOutcome::Existing(key) => {
                let entry_dir = self.paths.entry_dir(&key);
                self.open_existing(url, &key, &entry_dir)
            }
        }
    }

    /// Refresh an existing entry if it is stale.
    ///
    /// Staleness is checked again under the lock, so concurrent callers
    /// produce a single fetch and pull.
    pub fn update_entry(&self, entry_dir: &Path) -> Result<UpdateOutcome, CacheError> {
        if !entry_exists(entry_dir) {
            return Err(CacheError::NotFound(entry_dir.to_path_buf()));
        }

        let _lock = self.lock_entry(entry_dir)?;
        let current = metadata::read_metadata(entry_dir)?;
        let previous_hash = current.commit_hash.clone();

        let now = Utc::now();
        if !is_stale(&current, self.update_threshold, now) {
            log::debug!("{} is fresh, skipping update", entry_dir.display());
            return Ok(UpdateOutcome::unchanged(previous_hash));
        }

        let failed = |source| CacheError::UpdateFailed {
            path: entry_dir.to_path_buf(),
            source,
        };

        let pull = {
            let _permit = self.limiter.acquire();
            self.git.clean(entry_dir, &[METADATA_FILE]).map_err(failed)?;
            self.git.fetch(entry_dir).map_err(failed)?;
            self.git
                .pull(entry_dir, "origin", &current.branch)
                .map_err(failed)?
        };

        let current_hash = self.git.latest_commit(entry_dir).unwrap_or_else(|e| {
            log::warn!("cannot read HEAD of {}: {}", entry_dir.display(), e);
            previous_hash.clone()
        });

        let mut refreshed = RepoMetadata {
            last_updated: now,
            commit_hash: current_hash.clone(),
            ..current
        };
        refreshed.touch(now);
        record_size(entry_dir, &mut refreshed);
        metadata::write_metadata(entry_dir, &refreshed)?;

        let outcome = UpdateOutcome {
            updated: current_hash != previous_hash,
            previous_hash,
            current_hash,
            change_count: pull.files_changed,
        };
        log::info!(
            "updated {}: {} -> {} ({} files changed)",
            entry_dir.display(),
            short_hash(&outcome.previous_hash),
            short_hash(&outcome.current_hash),
            outcome.change_count
        );
        Ok(outcome)
    }

    /// Resolve `url` and `branch` and refresh that entry if stale.
    pub fn update_repository(
        &self,
        url: &str,
        branch: Option<&str>,
    ) -> Result<UpdateOutcome, CacheError> {
        let info = self.entry_info(url, branch)?;
        self.update_entry(&info.local_path)
    }

    /// Where the entry for `url` and `branch` lives and what its sidecar says.
    /// Touches nothing.
    pub fn entry_info(&self, url: &str, branch: Option<&str>) -> Result<EntryInfo, CacheError> {
        let repo_url = RepoUrl::parse(url)?;
        let requested = branch.unwrap_or(&self.default_branch);
        let branch = self
            .redirects
            .resolve(repo_url.canonical(), requested)
            .unwrap_or_else(|| requested.to_string());
        let key = EntryKey::new(&repo_url, &branch)?;
        let local_path = self.paths.entry_dir(&key);

        let exists = entry_exists(&local_path);
        let metadata = if exists {
            metadata::read_metadata(&local_path).ok()
        } else {
            None
        };

        Ok(EntryInfo {
            url: repo_url,
            branch,
            local_path,
            exists,
            metadata,
        })
    }

    /// File and size statistics for one entry.
    pub fn entry_stats(&self, entry_dir: &Path) -> Result<EntryStats, CacheError> {
        if !entry_exists(entry_dir) {
            return Err(CacheError::NotFound(entry_dir.to_path_buf()));
        }
        stats::entry_stats(entry_dir).map_err(|e| CacheError::storage(entry_dir, e))
    }

    pub fn aggregate_stats(&self) -> Result<AggregateStats, CacheError> {
        stats::aggregate_stats(&self.paths)
            .map_err(|e| CacheError::storage(self.paths.storage_root(), e))
    }

    fn lock_entry(&self, entry_dir: &Path) -> Result<RepoLock, CacheError> {
        let lock_path = self.paths.lock_path(entry_dir);
        RepoLock::acquire(&lock_path, &self.lock_options).map_err(|source| CacheError::LockFailed {
            path: entry_dir.to_path_buf(),
            source,
        })
    }

    /// Serve an entry already on disk: repair its sidecar if needed, record
    /// the access and refresh it when stale.
    fn open_existing(
        &self,
        url: &RepoUrl,
        key: &EntryKey,
        entry_dir: &Path,
    ) -> Result<CacheEntry, CacheError> {
        let current = match metadata::read_metadata(entry_dir) {
            Ok(current) => current,
            Err(err) => {
                log::warn!("{}; repairing", err);
                self.repair_entry(url, key, entry_dir)
            }
        };
        let current = self.record_access(entry_dir, current);

        if !is_stale(&current, self.update_threshold, Utc::now()) {
            return Ok(CacheEntry::from_metadata(entry_dir, current));
        }

        match self.update_entry(entry_dir) {
            Ok(_) => match metadata::read_metadata(entry_dir) {
                Ok(refreshed) => Ok(CacheEntry::from_metadata(entry_dir, refreshed)),
                Err(err) => {
                    log::warn!("{} after update; using previous metadata", err);
                    Ok(CacheEntry::from_metadata(entry_dir, current))
                }
            },
            Err(err) => {
                log::warn!("{}; serving cached copy of {}", err, key);
                Ok(CacheEntry::from_metadata(entry_dir, current))
            }
        }
    }

    /// Repair under the entry lock. If the lock cannot be had, the metadata is
    /// derived without being written.
    fn repair_entry(&self, url: &RepoUrl, key: &EntryKey, entry_dir: &Path) -> RepoMetadata {
        match self.lock_entry(entry_dir) {
            Ok(_lock) => match metadata::read_metadata(entry_dir) {
                // repaired by someone else while we waited
                Ok(current) => current,
                Err(_) => metadata::repair(self.git.as_ref(), entry_dir, url, &key.branch),
            },
            Err(err) => {
                log::warn!("{}; repairing without persisting", err);
                let now = Utc::now();
                let branch = self
                    .git
                    .current_branch(entry_dir)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| key.branch.clone());
                let commit = self
                    .git
                    .latest_commit(entry_dir)
                    .unwrap_or_else(|_| UNKNOWN_COMMIT.to_string());
                RepoMetadata::fresh(url, &branch, commit, now)
            }
        }
    }

    /// Advance `last_accessed` and persist it if the entry is not busy.
    ///
    /// A busy entry is being cloned or updated; its holder writes fresh
    /// timestamps itself, so skipping the write loses nothing.
    fn record_access(&self, entry_dir: &Path, mut current: RepoMetadata) -> RepoMetadata {
        let now = Utc::now();
        current.touch(now);

        let lock_path = self.paths.lock_path(entry_dir);
        match RepoLock::try_acquire(&lock_path, self.lock_options.stale_after) {
            Ok(Some(_lock)) => {
                let mut latest = metadata::read_metadata(entry_dir).unwrap_or(current);
                latest.touch(now);
                if let Err(err) = metadata::write_metadata(entry_dir, &latest) {
                    log::warn!("failed to record access: {}", err);
                }
                latest
            }
            Ok(None) => {
                log::debug!("{} is busy, not persisting access time", entry_dir.display());
                current
            }
            Err(err) => {
                log::warn!("failed to record access: {}", err);
                current
            }
        }
    }

    /// Run the branch fallback chain. The caller holds the lock on `entry_dir`.
    fn clone_locked(
        &self,
        url: &RepoUrl,
        key: &EntryKey,
        entry_dir: &Path,
    ) -> Result<CloneOutcome, CacheError> {
        if entry_dir.exists() {
            log::info!("removing existing directory {}", entry_dir.display());
            fs::remove_dir_all(entry_dir).map_err(|e| CacheError::storage(entry_dir, e))?;
        }

        let result = {
            let _permit = self.limiter.acquire();
            let branch = Some(key.branch.as_str());
            self.git
                .clone_repo(url.clone_url(), entry_dir, self.clone_depth, branch)
        };
        match result {
            Ok(()) => {
                return self
                    .finish_clone(url, key, entry_dir, CloneStage::RequestedBranch)
                    .map(CloneOutcome::Created);
            }
            Err(GitError::BranchNotFound(_)) => {
                log::warn!("branch '{}' not found on {}, trying fallbacks", key.branch, url);
            }
            Err(err) => return Err(CacheError::clone_failed(url, err)),
        }

        if let Some((branch, stage)) = self.resolve_fallback_branch(url) {
            if branch != key.branch {
                match self.clone_at_branch(url, key, &branch, stage) {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) => log::warn!("{}; trying unqualified clone", err),
                }
            }
        }

        self.clone_unqualified(url, key, entry_dir)
    }

    /// The existing entry a remembered redirect for `key` points at.
    fn redirected_entry(&self, url: &RepoUrl, key: &EntryKey) -> Option<EntryKey> {
        let branch = self.redirects.resolve(url.canonical(), &key.branch)?;
        let actual = key.with_branch(&branch).ok()?;
        entry_exists(&self.paths.entry_dir(&actual)).then_some(actual)
    }

    /// Detected default branch first, then the conventional names.
    fn resolve_fallback_branch(&self, url: &RepoUrl) -> Option<(String, CloneStage)> {
        match self.git.default_branch(url.clone_url()) {
            Ok(Some(branch)) => return Some((branch, CloneStage::DetectedBranch)),
            Ok(None) => log::debug!("{} does not advertise a default branch", url),
            Err(err) => log::warn!("default branch detection failed for {}: {}", url, err),
        }

        for candidate in COMMON_BRANCHES {
            match self.git.remote_branch_exists(url.clone_url(), candidate) {
                Ok(true) => return Some((candidate.to_string(), CloneStage::ProbedBranch)),
                Ok(false) => {}
                Err(err) => log::debug!("probe of '{}' on {} failed: {}", candidate, url, err),
            }
        }
        None
    }

    /// Clone at a fallback branch into the entry keyed by that branch.
    fn clone_at_branch(
        &self,
        url: &RepoUrl,
        requested: &EntryKey,
        branch: &str,
        stage: CloneStage,
    ) -> Result<CloneOutcome, CacheError> {
        let actual = requested.with_branch(branch)?;
        let actual_dir = self.paths.entry_dir(&actual);

        let _lock = self.lock_entry(&actual_dir)?;
        if entry_exists(&actual_dir) {
            self.redirects
                .insert(url.canonical(), &requested.branch, branch);
            return Ok(CloneOutcome::Existing(actual));
        }
        if actual_dir.exists() {
            fs::remove_dir_all(&actual_dir).map_err(|e| CacheError::storage(&actual_dir, e))?;
        }

        {
            let _permit = self.limiter.acquire();
            self.git
                .clone_repo(url.clone_url(), &actual_dir, self.clone_depth, Some(branch))
                .map_err(|e| CacheError::clone_failed(url, e))?;
        }
        let entry = self.finish_clone(url, &actual, &actual_dir, stage)?;
        self.redirects
            .insert(url.canonical(), &requested.branch, branch);
        Ok(CloneOutcome::Created(entry))
    }

    /// Clone whatever the remote checks out, then file it under that branch.
    fn clone_unqualified(
        &self,
        url: &RepoUrl,
        requested: &EntryKey,
        requested_dir: &Path,
    ) -> Result<CloneOutcome, CacheError> {
        let staging = self.paths.staging_dir(requested);
        {
            let _permit = self.limiter.acquire();
            if let Err(err) = self
                .git
                .clone_repo(url.clone_url(), &staging, self.clone_depth, None)
            {
                let _ = fs::remove_dir_all(&staging);
                return Err(CacheError::clone_failed(url, err));
            }
        }

        let branch = match self.git.current_branch(&staging) {
            Ok(Some(branch)) => branch,
            Ok(None) => {
                log::warn!(
                    "unqualified clone of {} is detached; filing under '{}'",
                    url,
                    requested.branch
                );
                requested.branch.clone()
            }
            Err(err) => {
                log::warn!("cannot read branch of unqualified clone of {}: {}", url, err);
                requested.branch.clone()
            }
        };

        let actual = match requested.with_branch(&branch) {
            Ok(actual) => actual,
            Err(_) => requested.clone(),
        };
        let actual_dir = self.paths.entry_dir(&actual);

        let result =
            self.promote_staging(url, requested, requested_dir, &actual, &actual_dir, &staging);
        if result.is_err() || staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn promote_staging(
        &self,
        url: &RepoUrl,
        requested: &EntryKey,
        requested_dir: &Path,
        actual: &EntryKey,
        actual_dir: &Path,
        staging: &Path,
    ) -> Result<CloneOutcome, CacheError> {
        // The requested entry's lock is already held by our caller.
        let _lock = if actual_dir == requested_dir {
            None
        } else {
            Some(self.lock_entry(actual_dir)?)
        };

        if actual.branch != requested.branch {
            self.redirects
                .insert(url.canonical(), &requested.branch, &actual.branch);
            if entry_exists(actual_dir) {
                return Ok(CloneOutcome::Existing(actual.clone()));
            }
        }
        if actual_dir.exists() {
            fs::remove_dir_all(actual_dir).map_err(|e| CacheError::storage(actual_dir, e))?;
        }
        fs::rename(staging, actual_dir).map_err(|e| CacheError::storage(actual_dir, e))?;

        self.finish_clone(url, actual, actual_dir, CloneStage::Unqualified)
            .map(CloneOutcome::Created)
    }

    /// Write the sidecar for a fresh clone.
    fn finish_clone(
        &self,
        url: &RepoUrl,
        key: &EntryKey,
        entry_dir: &Path,
        stage: CloneStage,
    ) -> Result<CacheEntry, CacheError> {
        let commit = self.git.latest_commit(entry_dir).unwrap_or_else(|e| {
            log::warn!("cannot read HEAD of new clone {}: {}", entry_dir.display(), e);
            UNKNOWN_COMMIT.to_string()
        });

        let mut fresh = RepoMetadata::fresh(url, &key.branch, commit, Utc::now());
        record_size(entry_dir, &mut fresh);
        metadata::write_metadata(entry_dir, &fresh)?;

        log::info!(
            "cloned {} at {} ({}) into {}",
            url,
            key.branch,
            stage,
            entry_dir.display()
        );
        Ok(CacheEntry::from_metadata(entry_dir, fresh))
    }
}

fn record_size(entry_dir: &Path, metadata: &mut RepoMetadata) {
    match stats::entry_stats(entry_dir) {
        Ok(stats) => {
            metadata.size_mb = Some(stats.total_size_mb);
            metadata.file_count = Some(stats.file_count);
        }
        Err(err) => log::debug!("cannot size {}: {}", entry_dir.display(), err),
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
