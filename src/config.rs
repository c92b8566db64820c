//! Configuration loading
//!
//! Settings live in a TOML file with four tables (`[repository]`, `[lock]`,
//! `[git]`, `[cleanup]`). Every field has a default, so an empty file or no
//! file at all yields a usable configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::LockOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub lock: LockConfig,
    pub git: GitConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Root directory holding one subdirectory per cache entry.
    pub storage_path: PathBuf,
    pub clone_depth: u32,
    /// Entries older than this are refreshed on access.
    pub update_threshold_hours: u64,
    pub default_branch: String,
    /// Upper bound on concurrent clone and update operations.
    pub max_concurrent_operations: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            clone_depth: 1,
            update_threshold_hours: 24,
            default_branch: "main".to_string(),
            max_concurrent_operations: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_interval_ms: u64,
    /// A lock stamp older than this is treated as abandoned.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            retries: 600,
            retry_interval_ms: 500,
            stale_after_secs: 900,
        }
    }
}

impl LockConfig {
    pub fn options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Wall-clock limit for any single git subprocess.
    pub timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL for a timed-out subprocess.
    pub termination_grace_secs: u64,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            termination_grace_secs: 5,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub retention_days: u32,
    pub max_storage_gb: f64,
    pub cleanup_on_startup: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            retention_days: 7,
            max_storage_gb: 10.0,
            cleanup_on_startup: false,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.saturating_mul(3600))
    }

    /// Storage cap in bytes; GB here means 1024³ bytes.
    pub fn max_storage_bytes(&self) -> u64 {
        (self.max_storage_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// `<user cache dir>/repocache/repositories`, falling back to a relative path
/// when the platform has no cache dir.
pub fn default_storage_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("repocache")
        .join("repositories")
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let repo = &self.repository;
        if repo.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "repository.storage_path must not be empty".into(),
            ));
        }
        if repo.clone_depth == 0 {
            return Err(ConfigError::Invalid(
                "repository.clone_depth must be at least 1".into(),
            ));
        }
        if repo.max_concurrent_operations == 0 {
            return Err(ConfigError::Invalid(
                "repository.max_concurrent_operations must be at least 1".into(),
            ));
        }
        if crate::types::validate_branch(&repo.default_branch).is_err() {
            return Err(ConfigError::Invalid(format!(
                "repository.default_branch '{}' is not a valid branch name",
                repo.default_branch
            )));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock.retry_interval_ms must be positive".into(),
            ));
        }
        if self.git.timeout_secs == 0 {
            return Err(ConfigError::Invalid("git.timeout_secs must be positive".into()));
        }
        if self.cleanup.interval_hours == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.interval_hours must be at least 1".into(),
            ));
        }
        if !(self.cleanup.max_storage_gb.is_finite() && self.cleanup.max_storage_gb > 0.0) {
            return Err(ConfigError::Invalid(
                "cleanup.max_storage_gb must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.repository.clone_depth, 1);
        assert_eq!(config.repository.update_threshold_hours, 24);
        assert_eq!(config.repository.default_branch, "main");
        assert_eq!(config.lock.timeout_secs, 300);
        assert_eq!(config.cleanup.retention_days, 7);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [repository]
            storage_path = "/tmp/repos"
            update_threshold_hours = 1

            [cleanup]
            max_storage_gb = 2.5
            "#,
        )
        .unwrap();

        assert_eq!(config.repository.storage_path, PathBuf::from("/tmp/repos"));
        assert_eq!(config.repository.update_threshold_hours, 1);
        assert_eq!(config.repository.clone_depth, 1);
        assert_eq!(config.cleanup.max_storage_gb, 2.5);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn rejects_zero_depth() {
        let err = Config::from_toml("[repository]\nclone_depth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_default_branch() {
        let err = Config::from_toml("[repository]\ndefault_branch = \"-rf\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = Config::from_toml("[repository\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn storage_cap_uses_binary_gigabytes() {
        let cleanup = CleanupConfig {
            max_storage_gb: 1.0,
            ..CleanupConfig::default()
        };
        assert_eq!(cleanup.max_storage_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn lock_options_convert_units() {
        let options = LockConfig::default().options();
        assert_eq!(options.timeout, Duration::from_secs(300));
        assert_eq!(options.retry_interval, Duration::from_millis(500));
        assert_eq!(options.stale_after, Duration::from_secs(900));
        assert_eq!(options.retries, 600);
    }
}
