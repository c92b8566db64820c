//! Per-entry metadata sidecar (`.repo_metadata.json`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::git::Git;
use super::paths::CachePaths;
use crate::types::{CloneMethod, RepoUrl, normalize_url};

/// Commit recorded when HEAD cannot be read.
pub const UNKNOWN_COMMIT: &str = "unknown";

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata at {path} is not valid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    /// Canonical repository URL.
    pub url: String,
    pub branch: String,
    pub last_updated: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub commit_hash: String,
    pub clone_method: CloneMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
}

impl RepoMetadata {
    /// Metadata for a checkout that has just been cloned or refreshed.
    pub fn fresh(url: &RepoUrl, branch: &str, commit_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            url: url.canonical().to_string(),
            branch: branch.to_string(),
            last_updated: now,
            last_accessed: now,
            commit_hash,
            clone_method: url.clone_method(),
            size_mb: None,
            file_count: None,
        }
    }

    /// Advance `last_accessed` to `now`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed {
            self.last_accessed = now;
        }
    }
}

pub fn read_metadata(entry_dir: &Path) -> Result<RepoMetadata, MetadataError> {
    let path = CachePaths::metadata_path(entry_dir);
    let contents = fs::read_to_string(&path).map_err(|source| MetadataError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| MetadataError::Json { path, source })
}

/// Write the sidecar via a temp file and rename, so readers never observe a
/// partially written file.
pub fn write_metadata(entry_dir: &Path, metadata: &RepoMetadata) -> Result<(), MetadataError> {
    let path = CachePaths::metadata_path(entry_dir);
    let json = serde_json::to_string_pretty(metadata).map_err(|source| MetadataError::Json {
        path: path.clone(),
        source,
    })?;

    let io_err = |source| MetadataError::Io {
        path: path.clone(),
        source,
    };

    loop {
        let counter = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = path.with_extension(format!("json.tmp.{}.{}", std::process::id(), counter));

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
        {
            Ok(mut file) => {
                let written = io::Write::write_all(&mut file, json.as_bytes())
                    .and_then(|()| file.sync_all())
                    .and_then(|()| fs::rename(&temp_path, &path));
                if let Err(e) = written {
                    let _ = fs::remove_file(&temp_path);
                    return Err(io_err(e));
                }
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
}

/// Rebuild metadata from the checkout itself and write it back.
///
/// Used when the sidecar is missing or unreadable. Never fails: fields that
/// cannot be read from the checkout fall back to `expected_branch`,
/// [`UNKNOWN_COMMIT`] and `original_url`, and a failed write is only logged.
pub fn repair(
    git: &dyn Git,
    entry_dir: &Path,
    original_url: &RepoUrl,
    expected_branch: &str,
) -> RepoMetadata {
    let branch = match git.current_branch(entry_dir) {
        Ok(Some(branch)) => branch,
        Ok(None) => expected_branch.to_string(),
        Err(e) => {
            log::warn!("repair {}: cannot read branch: {}", entry_dir.display(), e);
            expected_branch.to_string()
        }
    };

    let commit_hash = git.latest_commit(entry_dir).unwrap_or_else(|e| {
        log::warn!("repair {}: cannot read HEAD: {}", entry_dir.display(), e);
        UNKNOWN_COMMIT.to_string()
    });

    let url = match git.remote_url(entry_dir, "origin") {
        Ok(Some(remote)) => normalize_url(&remote).unwrap_or_else(|_| remote),
        Ok(None) => original_url.canonical().to_string(),
        Err(e) => {
            log::warn!("repair {}: cannot read origin: {}", entry_dir.display(), e);
            original_url.canonical().to_string()
        }
    };

    let now = Utc::now();
    let metadata = RepoMetadata {
        url,
        branch,
        last_updated: now,
        last_accessed: now,
        commit_hash,
        clone_method: original_url.clone_method(),
        size_mb: None,
        file_count: None,
    };

    match write_metadata(entry_dir, &metadata) {
        Ok(()) => log::info!("repaired metadata for {}", entry_dir.display()),
        Err(e) => log::warn!("failed to persist repaired metadata: {}", e),
    }
    metadata
}
