//! Git clone cache

mod git;
mod limiter;
mod lock;
mod metadata;
mod paths;
mod redirects;
mod repo;
mod staleness;
mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use git::{Git, GitCli, GitError, open_repository};
pub use lock::{LockError, LockOptions, RepoLock};
pub use metadata::{MetadataError, RepoMetadata, read_metadata, write_metadata};
pub use paths::{CachePaths, METADATA_FILE, entry_exists};
pub use repo::{CacheEntry, CacheError, EnsureOptions, EntryInfo, RepoCache, UpdateOutcome};
pub use stats::{AggregateStats, EntryStats, dir_size, round_mb};
