//! Cleanup scheduler thread for periodic eviction passes.
//!
//! One background thread runs an eviction pass every `interval_hours`. Passes
//! are single-flight: a manual trigger while any pass runs is rejected rather
//! than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use serde::Serialize;
use thiserror::Error;

use crate::cache::{CacheError, RepoCache};
use crate::config::CleanupConfig;

use super::gc::{self, EvictionPolicy, EvictionReport};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("an eviction pass is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to spawn cleanup thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    /// The background thread is alive.
    pub scheduled: bool,
    /// A pass is in progress.
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
}

struct Inner {
    cache: Arc<RepoCache>,
    config: CleanupConfig,
    running: AtomicBool,
    next_run: Mutex<Option<DateTime<Utc>>>,
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct CleanupScheduler {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

/// Clears the running flag when a pass ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Recovering from poisoned scheduler mutex");
            poisoned.into_inner()
        }
    }
}

impl Inner {
    /// Run one pass unless one is already in progress.
    fn run_pass(&self) -> Result<EvictionReport, SchedulerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let policy = EvictionPolicy::from_config(&self.config);
        Ok(gc::evict(&self.cache, &policy)?)
    }

    /// Scheduled passes only log their outcome.
    fn scheduled_pass(&self) {
        match self.run_pass() {
            Ok(report) if !report.errors.is_empty() => log::warn!(
                "scheduled eviction finished with {} errors",
                report.errors.len()
            ),
            Ok(_) => {}
            Err(SchedulerError::AlreadyRunning) => {
                log::info!("skipping scheduled eviction: a pass is already running")
            }
            Err(err) => log::warn!("scheduled eviction failed: {}", err),
        }
    }

    fn set_next_run(&self, next: Option<DateTime<Utc>>) {
        *lock_recover(&self.next_run) = next;
    }
}

impl CleanupScheduler {
    pub fn new(cache: Arc<RepoCache>, config: CleanupConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                config,
                running: AtomicBool::new(false),
                next_run: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background thread. A no-op when cleanup is disabled or the
    /// thread is already running.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if !self.inner.config.enabled {
            log::info!("cleanup scheduler disabled");
            return Ok(());
        }

        let mut worker = lock_recover(&self.worker);
        if worker.is_some() {
            return Ok(());
        }

        let interval = self.inner.config.interval();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner = Arc::clone(&self.inner);

        let thread = thread::Builder::new()
            .name("repocache-cleanup".to_string())
            .spawn(move || {
                if inner.config.cleanup_on_startup {
                    inner.scheduled_pass();
                }
                loop {
                    let next = TimeDelta::from_std(interval).ok().map(|d| Utc::now() + d);
                    inner.set_next_run(next);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => inner.scheduled_pass(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                inner.set_next_run(None);
                log::info!("cleanup scheduler stopped");
            })
            .map_err(SchedulerError::Spawn)?;

        log::info!(
            "cleanup scheduler started: every {}h, retention {} days",
            self.inner.config.interval_hours,
            self.inner.config.retention_days
        );
        *worker = Some(Worker { stop_tx, thread });
        Ok(())
    }

    /// Stop the background thread and wait for it. Safe to call when not
    /// started; waits for a pass in progress to finish.
    pub fn stop(&self) {
        let worker = lock_recover(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                log::warn!("cleanup thread panicked");
            }
        }
    }

    /// Run a pass now, outside the schedule.
    pub fn trigger_manually(&self) -> Result<EvictionReport, SchedulerError> {
        log::info!("manual eviction requested");
        self.inner.run_pass()
    }

    pub fn status(&self) -> SchedulerStatus {
        let scheduled = lock_recover(&self.worker).is_some();
        SchedulerStatus {
            enabled: self.inner.config.enabled,
            scheduled,
            running: self.inner.running.load(Ordering::SeqCst),
            next_run: *lock_recover(&self.inner.next_run),
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::FakeGit;
    use crate::cache::{RepoMetadata, write_metadata};
    use crate::config::Config;
    use crate::types::RepoUrl;
    use std::path::Path;
    use std::sync::Barrier;
    use std::time::{Duration, Instant};
    use tempfile::{TempDir, tempdir};

    fn scheduler(dir: &TempDir, cleanup: CleanupConfig) -> CleanupScheduler {
        let mut config = Config::default();
        config.repository.storage_path = dir.path().join("repositories");
        let cache = RepoCache::with_git(&config, Arc::new(FakeGit::new())).unwrap();
        CleanupScheduler::new(Arc::new(cache), cleanup)
    }

    fn expired_entry(root: &Path) -> std::path::PathBuf {
        let entry = root.join("acme_widgets_main_b28b7af6");
        std::fs::create_dir_all(entry.join(".git")).unwrap();
        // no sidecar, so it counts as expired
        entry
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn trigger_reports_storage_errors() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, CleanupConfig::default());
        let root = scheduler.inner.cache.paths().storage_root().to_path_buf();
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, "not a directory").unwrap();

        let err = scheduler.trigger_manually().unwrap_err();
        assert!(matches!(err, SchedulerError::Cache(CacheError::Storage { .. })));
        // the flag is cleared on failure too
        assert!(!scheduler.status().running);
    }

    #[test]
    fn trigger_runs_a_pass() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, CleanupConfig::default());
        let entry = expired_entry(scheduler.inner.cache.paths().storage_root());

        let report = scheduler.trigger_manually().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!entry.exists());
        assert!(!scheduler.status().running);
    }

    #[test]
    fn trigger_rejected_while_pass_runs() {
        // a pass in progress, scheduled or manual, holds the flag
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, CleanupConfig::default());

        scheduler.inner.running.store(true, Ordering::SeqCst);
        assert!(scheduler.status().running);
        assert!(matches!(
            scheduler.trigger_manually(),
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.inner.running.store(false, Ordering::SeqCst);
        assert!(scheduler.trigger_manually().is_ok());
    }

    #[test]
    fn simultaneous_triggers_run_one_pass() {
        let dir = tempdir().unwrap();
        let scheduler = Arc::new(scheduler(&dir, CleanupConfig::default()));
        let root = scheduler.inner.cache.paths().storage_root().to_path_buf();

        // enough fresh entries that one pass outlasts the barrier release
        let url: RepoUrl = "https://github.com/acme/widgets".parse().unwrap();
        for i in 0..400 {
            let branch = format!("b{i}");
            let entry = root.join(format!("acme_widgets_{branch}"));
            std::fs::create_dir_all(entry.join(".git")).unwrap();
            for f in 0..20 {
                std::fs::write(entry.join(format!("f{f}.txt")), "x").unwrap();
            }
            let metadata = RepoMetadata::fresh(&url, &branch, "abc123".into(), Utc::now());
            write_metadata(&entry, &metadata).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    scheduler.trigger_manually()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let passes = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(SchedulerError::AlreadyRunning)))
            .count();
        assert_eq!(passes, 1);
        assert_eq!(rejected, 1);
        assert!(!scheduler.status().running);
    }

    #[test]
    fn start_and_stop_update_status() {
        let dir = tempdir().unwrap();
        let scheduler = scheduler(&dir, CleanupConfig::default());

        let before = scheduler.status();
        assert!(before.enabled);
        assert!(!before.scheduled);
        assert_eq!(before.next_run, None);

        scheduler.start().unwrap();
        assert!(scheduler.status().scheduled);
        let armed = wait_until(Duration::from_secs(2), || scheduler.status().next_run.is_some());
        assert!(armed);
        let next = scheduler.status().next_run.unwrap();
        assert!(next > Utc::now() + TimeDelta::hours(23));

        scheduler.stop();
        let after = scheduler.status();
        assert!(!after.scheduled);
        assert_eq!(after.next_run, None);

        // stopping twice is fine
        scheduler.stop();
    }

    #[test]
    fn disabled_scheduler_does_not_start() {
        let dir = tempdir().unwrap();
        let cleanup = CleanupConfig {
            enabled: false,
            ..CleanupConfig::default()
        };
        let scheduler = scheduler(&dir, cleanup);

        scheduler.start().unwrap();
        let status = scheduler.status();
        assert!(!status.enabled);
        assert!(!status.scheduled);
    }

    #[test]
    fn cleanup_on_startup_runs_immediately() {
        let dir = tempdir().unwrap();
        let cleanup = CleanupConfig {
            cleanup_on_startup: true,
            ..CleanupConfig::default()
        };
        let scheduler = scheduler(&dir, cleanup);
        let entry = expired_entry(scheduler.inner.cache.paths().storage_root());

        scheduler.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !entry.exists()));
        scheduler.stop();
    }
}
