//! Memory of branch fallbacks.
//!
//! When a requested branch does not exist and the entry lands under another
//! branch (e.g. `master` requested, `main` cloned), later requests for the same
//! `(url, branch)` go straight to the real entry instead of repeating the
//! failed clone and the remote probes.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default TTL for redirects (1 hour).
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct Redirect {
    branch: String,
    recorded_at: Instant,
}

/// Maps `(canonical url, requested branch)` to the branch actually cloned.
///
/// Entries expire after `ttl` so that a branch created on the remote after the
/// first miss is eventually picked up.
pub struct BranchRedirects {
    entries: DashMap<(String, String), Redirect>,
    ttl: Duration,
}

impl Default for BranchRedirects {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchRedirects {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// The branch `requested` was redirected to, if still remembered.
    pub fn resolve(&self, url: &str, requested: &str) -> Option<String> {
        let key = (url.to_string(), requested.to_string());
        if let Some(entry) = self.entries.get(&key) {
            if entry.recorded_at.elapsed() < self.ttl {
                return Some(entry.branch.clone());
            }
            // Expired
            drop(entry);
            self.entries.remove(&key);
        }
        None
    }

    pub fn insert(&self, url: &str, requested: &str, actual: &str) {
        if requested == actual {
            return;
        }
        log::info!("remembering {url}: branch {requested} -> {actual}");
        self.entries.insert(
            (url.to_string(), requested.to_string()),
            Redirect {
                branch: actual.to_string(),
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn forget(&self, url: &str, requested: &str) {
        self.entries
            .remove(&(url.to_string(), requested.to_string()));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
