//! Eviction of cache entries by age and total size.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::cache::{
    CacheError, CachePaths, LockOptions, RepoCache, RepoLock, dir_size, read_metadata,
};
use crate::config::CleanupConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    /// Entries not accessed for this many days are deleted.
    pub retention_days: u32,
    /// When set, oldest entries are deleted until the total fits.
    pub max_storage_bytes: Option<u64>,
}

impl EvictionPolicy {
    pub fn from_config(config: &CleanupConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            max_storage_bytes: Some(config.max_storage_bytes()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub scanned: u64,
    pub deleted: u64,
    pub bytes_reclaimed: u64,
    /// Entries that were due for deletion but busy.
    pub skipped_locked: u64,
    /// Leftover staging directories of clones that died mid-way.
    pub staging_removed: u64,
    pub errors: Vec<String>,
}

struct Candidate {
    path: PathBuf,
    /// `None` when the sidecar is unreadable; sorts before every timestamp.
    last_accessed: Option<DateTime<Utc>>,
    size: u64,
}

pub fn evict(cache: &RepoCache, policy: &EvictionPolicy) -> Result<EvictionReport, CacheError> {
    let mut report = evict_at(cache.paths(), cache.lock_options(), policy, Utc::now())?;
    sweep_staging(
        cache.paths(),
        cache.staging_max_age(),
        SystemTime::now(),
        &mut report,
    );
    Ok(report)
}

/// One eviction pass as of `now`.
///
/// Entries are visited oldest access first. Each is deleted while it is past
/// retention or the running total exceeds the cap; the pass stops at the
/// first entry that satisfies both. Deletion takes the entry lock without
/// waiting, so an entry being cloned or updated is skipped.
///
/// Only failing to list the storage root is an error; per-entry failures are
/// collected in the report.
pub fn evict_at(
    paths: &CachePaths,
    lock_options: &LockOptions,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> Result<EvictionReport, CacheError> {
    let mut report = EvictionReport::default();

    let entries = paths.entry_dirs().map_err(|source| CacheError::Storage {
        path: paths.storage_root().to_path_buf(),
        source,
    })?;

    let mut candidates: Vec<Candidate> = entries
        .into_iter()
        .map(|path| {
            let last_accessed = match read_metadata(&path) {
                Ok(metadata) => Some(metadata.last_accessed),
                Err(err) => {
                    log::warn!("eviction: {}; treating as expired", err);
                    None
                }
            };
            let size = dir_size(&path);
            Candidate {
                path,
                last_accessed,
                size,
            }
        })
        .collect();
    candidates.sort_by_key(|c| c.last_accessed);

    report.scanned = candidates.len() as u64;
    // `None` when the retention reaches past the earliest representable time,
    // so nothing expires by age.
    let cutoff = TimeDelta::try_days(i64::from(policy.retention_days))
        .and_then(|retention| now.checked_sub_signed(retention));
    let mut total: u64 = candidates.iter().map(|c| c.size).sum();

    for candidate in &candidates {
        let expired = candidate
            .last_accessed
            .is_none_or(|t| cutoff.is_some_and(|cutoff| t < cutoff));
        let over_cap = policy.max_storage_bytes.is_some_and(|cap| total > cap);
        if !expired && !over_cap {
            break;
        }

        let lock_path = paths.lock_path(&candidate.path);
        let _lock = match RepoLock::try_acquire(&lock_path, lock_options.stale_after) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                log::warn!(
                    "eviction: {} is in use, skipping",
                    candidate.path.display()
                );
                report.skipped_locked += 1;
                continue;
            }
            Err(err) => {
                log::warn!(
                    "eviction: cannot lock {}: {}",
                    candidate.path.display(),
                    err
                );
                report
                    .errors
                    .push(format!("{}: {}", candidate.path.display(), err));
                continue;
            }
        };

        match fs::remove_dir_all(&candidate.path) {
            Ok(()) => {
                log::info!(
                    "evicted {} ({} bytes, {})",
                    candidate.path.display(),
                    candidate.size,
                    if expired { "expired" } else { "over storage cap" }
                );
                total = total.saturating_sub(candidate.size);
                report.deleted += 1;
                report.bytes_reclaimed += candidate.size;
            }
            Err(err) => {
                log::warn!(
                    "eviction: failed to delete {}: {}",
                    candidate.path.display(),
                    err
                );
                report
                    .errors
                    .push(format!("{}: {}", candidate.path.display(), err));
            }
        }
    }

    log::info!(
        "eviction pass: scanned {}, deleted {}, reclaimed {} bytes",
        report.scanned,
        report.deleted,
        report.bytes_reclaimed
    );
    Ok(report)
}

/// Remove staging directories whose mtime is older than `max_age`.
///
/// A clone cannot outlive the git timeout, so an older staging directory was
/// left by a process that died before promoting it.
pub fn sweep_staging(
    paths: &CachePaths,
    max_age: Duration,
    now: SystemTime,
    report: &mut EvictionReport,
) {
    let dirs = match paths.staging_dirs() {
        Ok(dirs) => dirs,
        Err(err) => {
            log::warn!("eviction: cannot list staging directories: {}", err);
            report.errors.push(format!("staging: {}", err));
            return;
        }
    };

    for dir in dirs {
        if !staging_expired(&dir, max_age, now) {
            continue;
        }
        let size = dir_size(&dir);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::info!("removed abandoned staging directory {}", dir.display());
                report.staging_removed += 1;
                report.bytes_reclaimed += size;
            }
            Err(err) => {
                log::warn!("eviction: failed to delete {}: {}", dir.display(), err);
                report.errors.push(format!("{}: {}", dir.display(), err));
            }
        }
    }
}

fn staging_expired(dir: &Path, max_age: Duration, now: SystemTime) -> bool {
    let modified = match fs::metadata(dir).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    now.duration_since(modified)
        .is_ok_and(|age| age > max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RepoMetadata, write_metadata};
    use crate::types::{EntryKey, RepoUrl};
    use std::fs::File;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    const MB: u64 = 1024 * 1024;

    fn setup() -> (TempDir, CachePaths) {
        let dir = tempdir().unwrap();
        let paths = CachePaths::new(dir.path().join("repositories"));
        paths.ensure_dirs().unwrap();
        (dir, paths)
    }

    fn make_entry(
        paths: &CachePaths,
        branch: &str,
        accessed: DateTime<Utc>,
        size: u64,
    ) -> PathBuf {
        let url: RepoUrl = "https://github.com/acme/widgets".parse().unwrap();
        let key = EntryKey::new(&url, branch).unwrap();
        let entry_dir = paths.entry_dir(&key);
        fs::create_dir_all(entry_dir.join(".git")).unwrap();

        // sparse, so large sizes cost nothing on disk
        File::create(entry_dir.join("blob.bin"))
            .unwrap()
            .set_len(size)
            .unwrap();

        let mut metadata = RepoMetadata::fresh(&url, branch, "abc123".into(), accessed);
        metadata.last_accessed = accessed;
        write_metadata(&entry_dir, &metadata).unwrap();
        entry_dir
    }

    fn policy(retention_days: u32, max_storage_bytes: Option<u64>) -> EvictionPolicy {
        EvictionPolicy {
            retention_days,
            max_storage_bytes,
        }
    }

    fn days_ago(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        now - TimeDelta::days(days)
    }

    #[test]
    fn removes_only_entries_past_retention() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let old = make_entry(&paths, "ten", days_ago(now, 10), 100);
        let mid = make_entry(&paths, "five", days_ago(now, 5), 100);
        let new = make_entry(&paths, "one", days_ago(now, 1), 100);

        let report = evict_at(&paths, &LockOptions::default(), &policy(7, None), now).unwrap();

        assert!(!old.exists());
        assert!(mid.exists());
        assert!(new.exists());
        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn removes_oldest_until_under_cap() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let base = days_ago(now, 1);
        let a = make_entry(&paths, "a", base, 40 * MB);
        let b = make_entry(&paths, "b", base + TimeDelta::seconds(1), 30 * MB);
        let c = make_entry(&paths, "c", base + TimeDelta::seconds(2), 30 * MB);

        let report = evict_at(
            &paths,
            &LockOptions::default(),
            &policy(365, Some(50 * MB)),
            now,
        )
        .unwrap();

        assert!(!a.exists());
        assert!(!b.exists());
        assert!(c.exists());
        assert_eq!(report.deleted, 2);
        assert!(report.bytes_reclaimed >= 70 * MB);
    }

    #[test]
    fn nothing_removed_when_within_limits() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        make_entry(&paths, "main", days_ago(now, 1), 10 * MB);

        let report = evict_at(
            &paths,
            &LockOptions::default(),
            &policy(7, Some(50 * MB)),
            now,
        )
        .unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(report.scanned, 1);
    }

    #[test]
    fn unreadable_metadata_is_evicted_first() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let fresh = make_entry(&paths, "main", days_ago(now, 1), 100);
        let broken = make_entry(&paths, "broken", now, 100);
        fs::write(broken.join(".repo_metadata.json"), "not json").unwrap();

        let report = evict_at(&paths, &LockOptions::default(), &policy(7, None), now).unwrap();

        assert!(!broken.exists());
        assert!(fresh.exists());
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn locked_entry_is_skipped() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let busy = make_entry(&paths, "busy", days_ago(now, 30), 100);
        let idle = make_entry(&paths, "idle", days_ago(now, 20), 100);

        let options = LockOptions {
            timeout: Duration::from_secs(1),
            ..LockOptions::default()
        };
        let _held = RepoLock::acquire(&paths.lock_path(&busy), &options).unwrap();

        let report = evict_at(&paths, &options, &policy(7, None), now).unwrap();

        assert!(busy.exists());
        assert!(!idle.exists());
        assert_eq!(report.skipped_locked, 1);
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn huge_retention_expires_nothing_by_age() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let old = make_entry(&paths, "ancient", days_ago(now, 3650), 100);

        let report = evict_at(
            &paths,
            &LockOptions::default(),
            &policy(u32::MAX, None),
            now,
        )
        .unwrap();

        assert!(old.exists());
        assert_eq!(report.deleted, 0);
    }

    #[test]
    fn huge_retention_still_applies_cap() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let a = make_entry(&paths, "a", days_ago(now, 2), 40 * MB);
        let b = make_entry(&paths, "b", days_ago(now, 1), 40 * MB);

        let report = evict_at(
            &paths,
            &LockOptions::default(),
            &policy(u32::MAX, Some(50 * MB)),
            now,
        )
        .unwrap();

        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn abandoned_staging_is_swept() {
        let (_dir, paths) = setup();
        let url: RepoUrl = "https://github.com/acme/widgets".parse().unwrap();
        let key = EntryKey::new(&url, "main").unwrap();

        let abandoned = paths.staging_dir(&key);
        fs::create_dir_all(abandoned.join(".git")).unwrap();
        fs::write(abandoned.join("README.md"), "# widgets\n").unwrap();
        let in_flight = paths.staging_dir(&key);
        fs::create_dir_all(&in_flight).unwrap();

        let now = SystemTime::now();
        let hour_ago = filetime::FileTime::from_system_time(now - Duration::from_secs(3600));
        filetime::set_file_mtime(&abandoned, hour_ago).unwrap();

        let mut report = EvictionReport::default();
        sweep_staging(&paths, Duration::from_secs(300), now, &mut report);

        assert!(!abandoned.exists());
        assert!(in_flight.exists());
        assert_eq!(report.staging_removed, 1);
        assert!(report.bytes_reclaimed > 0);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn staging_is_not_an_entry() {
        let (_dir, paths) = setup();
        let now = Utc::now();
        let url: RepoUrl = "https://github.com/acme/widgets".parse().unwrap();
        let staging = paths.staging_dir(&EntryKey::new(&url, "main").unwrap());
        fs::create_dir_all(staging.join(".git")).unwrap();

        let report = evict_at(&paths, &LockOptions::default(), &policy(0, Some(0)), now).unwrap();

        assert!(staging.exists());
        assert_eq!(report.scanned, 0);
    }

    #[test]
    fn empty_storage_is_a_no_op() {
        let (_dir, paths) = setup();
        let report =
            evict_at(&paths, &LockOptions::default(), &policy(7, Some(0)), Utc::now()).unwrap();
        assert_eq!(report, EvictionReport::default());
    }
}
