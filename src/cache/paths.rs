//! Cache directory path management
//!
//! ```text
//! <parent>/
//! ├── repositories/                          # storage root
//! │   ├── <owner>_<repo>_<branch>_<sha1:8>/  # one clone per entry
//! │   │   ├── .git/
//! │   │   └── .repo_metadata.json
//! │   └── .staging-<...>/                    # in-flight unqualified clones
//! └── repository_locks/
//!     └── <entry dir name>.lock
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::EntryKey;

/// Sidecar file name inside each entry directory.
pub const METADATA_FILE: &str = ".repo_metadata.json";

const LOCKS_DIR: &str = "repository_locks";
const STAGING_PREFIX: &str = ".staging-";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct CachePaths {
    storage_root: PathBuf,
    locks_dir: PathBuf,
}

impl CachePaths {
    /// Lock files live in a `repository_locks` sibling of the storage root.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let locks_dir = match storage_root.parent() {
            Some(parent) => parent.join(LOCKS_DIR),
            None => storage_root.join(LOCKS_DIR),
        };
        Self {
            storage_root,
            locks_dir,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    /// Create the storage root and lock directory.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.storage_root)?;
        fs::create_dir_all(&self.locks_dir)
    }

    pub fn entry_dir(&self, key: &EntryKey) -> PathBuf {
        self.storage_root.join(key.dir_name())
    }

    /// Lock file for an entry directory: `<locks_dir>/<dir name>.lock`.
    pub fn lock_path(&self, entry_dir: &Path) -> PathBuf {
        let name = entry_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.locks_dir.join(format!("{name}.lock"))
    }

    pub fn metadata_path(entry_dir: &Path) -> PathBuf {
        entry_dir.join(METADATA_FILE)
    }

    /// A fresh dot-prefixed directory under the storage root for a clone whose
    /// final branch is not known yet.
    pub fn staging_dir(&self, key: &EntryKey) -> PathBuf {
        let counter = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.storage_root.join(format!(
            "{STAGING_PREFIX}{}-{}-{}",
            key.dir_name(),
            std::process::id(),
            counter
        ))
    }

    /// Immediate subdirectories of the storage root, skipping dot-prefixed ones.
    pub fn entry_dirs(&self) -> io::Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.storage_root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Staging directories left under the storage root.
    pub fn staging_dirs(&self) -> io::Result<Vec<PathBuf>> {
        let read_dir = match fs::read_dir(&self.storage_root) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX)
                && entry.file_type()?.is_dir()
            {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// An entry exists once its directory holds a `.git` subdirectory.
pub fn entry_exists(entry_dir: &Path) -> bool {
    entry_dir.join(".git").is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepoUrl;
    use tempfile::tempdir;

    fn key(branch: &str) -> EntryKey {
        let url: RepoUrl = "https://github.com/acme/widgets".parse().unwrap();
        EntryKey::new(&url, branch).unwrap()
    }

    #[test]
    fn locks_dir_is_sibling_of_storage_root() {
        let paths = CachePaths::new("/var/cache/rc/repositories");
        assert_eq!(paths.locks_dir(), Path::new("/var/cache/rc/repository_locks"));
    }

    #[test]
    fn entry_dir_under_storage_root() {
        let paths = CachePaths::new("/var/cache/rc/repositories");
        let dir = paths.entry_dir(&key("main"));
        assert_eq!(dir.parent().unwrap(), paths.storage_root());
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("acme_widgets_main_")
        );
    }

    #[test]
    fn lock_path_named_after_entry_dir() {
        let paths = CachePaths::new("/var/cache/rc/repositories");
        let dir = paths.entry_dir(&key("main"));
        let lock = paths.lock_path(&dir);
        assert_eq!(lock.parent().unwrap(), paths.locks_dir());
        assert_eq!(
            lock.file_name().unwrap().to_string_lossy(),
            format!("{}.lock", key("main").dir_name())
        );
    }

    #[test]
    fn staging_dirs_are_unique_and_hidden() {
        let paths = CachePaths::new("/var/cache/rc/repositories");
        let a = paths.staging_dir(&key("main"));
        let b = paths.staging_dir(&key("main"));
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with('.'));
    }

    #[test]
    fn entry_dirs_skips_hidden_and_files() {
        let dir = tempdir().unwrap();
        let paths = CachePaths::new(dir.path().join("repositories"));
        paths.ensure_dirs().unwrap();

        fs::create_dir(paths.storage_root().join("acme_widgets_main_b28b7af6")).unwrap();
        fs::create_dir(paths.storage_root().join(".staging-x")).unwrap();
        fs::write(paths.storage_root().join("stray.txt"), "x").unwrap();

        let dirs = paths.entry_dirs().unwrap();
        assert_eq!(dirs.len(), 1);
        assert!(dirs[0].ends_with("acme_widgets_main_b28b7af6"));
    }

    #[test]
    fn staging_dirs_lists_only_staging() {
        let dir = tempdir().unwrap();
        let paths = CachePaths::new(dir.path().join("repositories"));
        paths.ensure_dirs().unwrap();
        let staging = paths.staging_dir(&key("main"));
        fs::create_dir(&staging).unwrap();
        fs::create_dir(paths.storage_root().join(".hidden")).unwrap();
        fs::create_dir(paths.storage_root().join("acme_widgets_main_b28b7af6")).unwrap();

        assert_eq!(paths.staging_dirs().unwrap(), vec![staging]);
    }

    #[test]
    fn entry_dirs_empty_when_root_missing() {
        let dir = tempdir().unwrap();
        let paths = CachePaths::new(dir.path().join("nope"));
        assert!(paths.entry_dirs().unwrap().is_empty());
    }

    #[test]
    fn entry_exists_requires_git_dir() {
        let dir = tempdir().unwrap();
        assert!(!entry_exists(dir.path()));
        fs::create_dir(dir.path().join(".git")).unwrap();
        assert!(entry_exists(dir.path()));
    }
}
