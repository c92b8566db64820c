//! Disk usage and content statistics for cache entries.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

use super::metadata::read_metadata;
use super::paths::CachePaths;

/// Extensions counted as source or documentation files.
const CODE_EXTENSIONS: &[&str] = &[
    "js", "ts", "tsx", "jsx", "py", "java", "cpp", "c", "h", "hpp", "cs", "php", "rb", "go", "rs",
    "swift", "kt", "scala", "clj", "hs", "elm", "dart", "vue", "svelte", "md", "json", "yaml",
    "yml", "xml", "html", "css", "scss", "sass", "less", "sql", "sh", "bash", "zsh", "fish",
    "ps1", "bat", "cmd", "r", "m", "mm", "pl", "pm",
];

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EntryStats {
    pub file_count: u64,
    pub total_size_mb: f64,
    pub code_file_count: u64,
    pub largest_file_size_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_entries: usize,
    /// Bytes on disk across all entries, `.git` included.
    pub disk_usage: u64,
    /// `None` when no entry has readable metadata.
    pub oldest_access: Option<DateTime<Utc>>,
    pub newest_access: Option<DateTime<Utc>>,
}

/// Megabytes rounded to two decimals.
pub fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / MIB * 100.0).round() / 100.0
}

fn is_code_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            CODE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Walk the working tree of an entry.
///
/// Hidden directories (`.git` among them) are skipped; hidden files are
/// counted. Symlinks are not followed and not counted.
pub fn entry_stats(entry_dir: &Path) -> io::Result<EntryStats> {
    let mut file_count = 0u64;
    let mut code_file_count = 0u64;
    let mut total_bytes = 0u64;
    let mut largest_bytes = 0u64;

    let walker = WalkDir::new(entry_dir).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !(e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with('.'))
    });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata()?.len();

        file_count += 1;
        total_bytes = total_bytes.saturating_add(size);
        largest_bytes = largest_bytes.max(size);
        if is_code_file(entry.path()) {
            code_file_count += 1;
        }
    }

    Ok(EntryStats {
        file_count,
        total_size_mb: round_mb(total_bytes),
        code_file_count,
        largest_file_size_mb: round_mb(largest_bytes),
    })
}

/// Total bytes of regular files under `path`, without following symlinks.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::debug!("dir_size: skipping unreadable path: {}", err);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .fold(0u64, |total, meta| total.saturating_add(meta.len()))
}

/// Summarise every entry under the storage root.
///
/// Entries whose metadata cannot be read still count towards the totals but
/// not towards the access range.
pub fn aggregate_stats(paths: &CachePaths) -> io::Result<AggregateStats> {
    let entries = paths.entry_dirs()?;
    let mut stats = AggregateStats {
        total_entries: entries.len(),
        ..AggregateStats::default()
    };

    for entry_dir in &entries {
        stats.disk_usage = stats.disk_usage.saturating_add(dir_size(entry_dir));

        match read_metadata(entry_dir) {
            Ok(metadata) => {
                let accessed = metadata.last_accessed;
                stats.oldest_access = Some(stats.oldest_access.map_or(accessed, |t| t.min(accessed)));
                stats.newest_access = Some(stats.newest_access.map_or(accessed, |t| t.max(accessed)));
            }
            Err(err) => log::warn!("stats: {}", err),
        }
    }

    Ok(stats)
}
