//! Staleness checking for cached repositories.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::metadata::RepoMetadata;

/// Whether an entry is due for a refresh.
///
/// Stale once `now - last_updated >= threshold`. A `last_updated` in the
/// future (clock skew) counts as fresh.
pub fn is_stale(metadata: &RepoMetadata, threshold: Duration, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(metadata.last_updated).to_std() {
        Ok(age) => age >= threshold,
        Err(_) => false,
    }
}

/// Convert a threshold in hours to a `Duration`.
pub fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}
