use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} ({attempts} attempts) waiting for lock {path}")]
    Timeout {
        path: PathBuf,
        waited: Duration,
        attempts: u32,
    },
    #[error("lock io error: {0}")]
    Io(#[from] io::Error),
}

/// Retry and staleness parameters for [`RepoLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_interval: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            retries: 600,
            retry_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(15 * 60),
        }
    }
}

/// A guard that holds an exclusive lock on one cache entry.
///
/// The lock file carries `<pid> <unix-secs>` of the holder. Released on drop:
/// the file is unlinked while still held, then unlocked.
#[derive(Debug)]
pub struct RepoLock {
    file: Option<File>,
    path: PathBuf,
}

impl RepoLock {
    /// Acquire the lock, polling every `retry_interval` until `timeout` elapses
    /// or `retries` extra attempts are used up, whichever comes first.
    pub fn acquire(lock_path: &Path, options: &LockOptions) -> Result<Self, LockError> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(lock) = Self::try_acquire(lock_path, options.stale_after)? {
                if attempts > 1 {
                    log::debug!(
                        "acquired {} after {} attempts ({:?})",
                        lock_path.display(),
                        attempts,
                        start.elapsed()
                    );
                }
                return Ok(lock);
            }

            let waited = start.elapsed();
            if waited >= options.timeout || attempts > options.retries {
                return Err(LockError::Timeout {
                    path: lock_path.to_path_buf(),
                    waited,
                    attempts,
                });
            }

            let remaining = options.timeout.saturating_sub(waited);
            std::thread::sleep(options.retry_interval.min(remaining));
        }
    }

    /// Try once without waiting. Returns `None` if a live holder has the lock.
    ///
    /// A holder whose stamp is older than `stale_after` is presumed dead: its
    /// lock file is unlinked and the attempt is repeated on a fresh file.
    pub fn try_acquire(lock_path: &Path, stale_after: Duration) -> Result<Option<Self>, LockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    // The path may have been unlinked and recreated between
                    // open and lock; holding an orphaned inode locks nothing.
                    if !names_same_file(&file, lock_path)? {
                        continue;
                    }
                    write_stamp(&file)?;
                    return Ok(Some(Self {
                        file: Some(file),
                        path: lock_path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let age = holder_age(&file);
                    if age < stale_after {
                        return Ok(None);
                    }
                    log::warn!(
                        "taking over stale lock {} (held for {:?})",
                        lock_path.display(),
                        age
                    );
                    match fs::remove_file(lock_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        // Only unlink the path if it still names our file; a contender may
        // have replaced it after a stale takeover.
        match names_same_file(&file, &self.path) {
            Ok(true) => {
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        log::warn!("failed to remove lock file {}: {}", self.path.display(), e);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => log::warn!("failed to stat lock file {}: {}", self.path.display(), e),
        }

        let _ = file.unlock();
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn names_same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn write_stamp(file: &File) -> io::Result<()> {
    let mut f = file;
    f.set_len(0)?;
    f.seek(SeekFrom::Start(0))?;
    write!(f, "{} {}", std::process::id(), unix_now())?;
    f.flush()
}

/// How long the current holder has had the lock.
///
/// Read from the stamp when it parses, otherwise from the file's mtime.
fn holder_age(file: &File) -> Duration {
    let mut contents = String::new();
    let mut f = file;
    let stamped = f
        .seek(SeekFrom::Start(0))
        .and_then(|_| f.read_to_string(&mut contents))
        .ok()
        .and_then(|_| parse_stamp(&contents));

    if let Some(acquired_at) = stamped {
        return Duration::from_secs(unix_now().saturating_sub(acquired_at));
    }

    file.metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or(Duration::ZERO)
}

fn parse_stamp(contents: &str) -> Option<u64> {
    let mut parts = contents.split_whitespace();
    let _pid: u32 = parts.next()?.parse().ok()?;
    parts.next()?.parse().ok()
}
