//! Background cleanup: eviction engine, scheduler and the foreground daemon.

pub mod gc;
pub mod scheduler;

use std::sync::Arc;

use crossbeam_channel::bounded;

use crate::cache::RepoCache;
use crate::config::Config;

pub use gc::{EvictionPolicy, EvictionReport, evict};
pub use scheduler::{CleanupScheduler, SchedulerError, SchedulerStatus};

/// Run the cleanup scheduler until SIGINT/SIGTERM.
pub fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let cache = Arc::new(RepoCache::new(config)?);
    let scheduler = CleanupScheduler::new(Arc::clone(&cache), config.cleanup.clone());

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    scheduler.start()?;
    log::info!(
        "daemon running, storage at {}",
        cache.paths().storage_root().display()
    );

    let _ = shutdown_rx.recv();
    log::info!("shutdown requested");
    scheduler.stop();
    Ok(())
}
