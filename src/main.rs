pub mod cache;
pub mod config;
pub mod daemon;
pub mod types;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::cache::{CachePaths, EnsureOptions, RepoCache};
use crate::config::Config;
use crate::daemon::EvictionPolicy;

#[derive(Parser)]
#[command(
    name = "repocache",
    about = "Keep a local cache of git clones keyed by repository and branch"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a repository into the cache, or refresh it if stale
    Ensure {
        /// Repository URL (https or ssh)
        url: String,

        #[arg(long, short)]
        branch: Option<String>,

        /// Delete any existing clone first
        #[arg(long)]
        force: bool,
    },

    /// Refresh a cached repository if it is stale
    Update {
        url: String,

        #[arg(long, short)]
        branch: Option<String>,
    },

    /// Show statistics for one entry, or for the whole cache
    Stats {
        url: Option<String>,

        #[arg(long, short)]
        branch: Option<String>,
    },

    /// Run an eviction pass now
    Evict {
        #[arg(long)]
        retention_days: Option<u32>,

        #[arg(long)]
        max_storage_gb: Option<f64>,
    },

    /// Run the cleanup scheduler in the foreground
    Daemon,

    /// Check dependencies
    Doctor,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Ensure { url, branch, force } => {
                cmd_ensure(&config, &url, branch.as_deref(), force)
            }
            Commands::Update { url, branch } => cmd_update(&config, &url, branch.as_deref()),
            Commands::Stats { url, branch } => {
                cmd_stats(&config, url.as_deref(), branch.as_deref())
            }
            Commands::Evict {
                retention_days,
                max_storage_gb,
            } => cmd_evict(&config, retention_days, max_storage_gb),
            Commands::Daemon => daemon::run(&config),
            Commands::Doctor => cmd_doctor(&config),
        },
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_ensure(
    config: &Config,
    url: &str,
    branch: Option<&str>,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = RepoCache::new(config)?;
    let entry = cache.ensure_entry_with(url, branch, EnsureOptions { force })?;

    println!("{}", entry.local_path.display());
    println!("  Branch: {}", entry.branch);
    println!("  Commit: {}", short_commit(&entry.commit_hash));
    println!("  Method: {}", entry.clone_method);
    Ok(())
}

fn cmd_update(
    config: &Config,
    url: &str,
    branch: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = RepoCache::new(config)?;
    let outcome = cache.update_repository(url, branch)?;

    if outcome.updated {
        println!(
            "Updated {} -> {} ({} files changed)",
            short_commit(&outcome.previous_hash),
            short_commit(&outcome.current_hash),
            outcome.change_count
        );
    } else {
        println!("Up to date at {}", short_commit(&outcome.current_hash));
    }
    Ok(())
}

fn cmd_stats(
    config: &Config,
    url: Option<&str>,
    branch: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = RepoCache::new(config)?;

    let Some(url) = url else {
        let stats = cache.aggregate_stats()?;
        println!("Entries:       {}", stats.total_entries);
        println!("Disk usage:    {}", format_bytes(stats.disk_usage));
        println!("Oldest access: {}", format_time(stats.oldest_access));
        println!("Newest access: {}", format_time(stats.newest_access));
        return Ok(());
    };

    let info = cache.entry_info(url, branch)?;
    let stats = cache.entry_stats(&info.local_path)?;
    println!("{}", info.local_path.display());
    println!("  Files:        {}", stats.file_count);
    println!("  Code files:   {}", stats.code_file_count);
    println!("  Total size:   {:.2} MB", stats.total_size_mb);
    println!("  Largest file: {:.2} MB", stats.largest_file_size_mb);
    if let Some(metadata) = info.metadata {
        println!("  Updated:      {}", metadata.last_updated.to_rfc3339());
        println!("  Accessed:     {}", metadata.last_accessed.to_rfc3339());
    }
    Ok(())
}

fn cmd_evict(
    config: &Config,
    retention_days: Option<u32>,
    max_storage_gb: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut cleanup = config.cleanup.clone();
    if let Some(days) = retention_days {
        cleanup.retention_days = days;
    }
    if let Some(gb) = max_storage_gb {
        if !gb.is_finite() || gb < 0.0 {
            return Err(format!("invalid --max-storage-gb: {}", gb).into());
        }
        cleanup.max_storage_gb = gb;
    }

    let cache = RepoCache::new(config)?;
    let report = daemon::evict(&cache, &EvictionPolicy::from_config(&cleanup))?;

    println!("Scanned:   {}", report.scanned);
    println!("Deleted:   {}", report.deleted);
    println!("Reclaimed: {}", format_bytes(report.bytes_reclaimed));
    if report.staging_removed > 0 {
        println!("Staging removed: {}", report.staging_removed);
    }
    if report.skipped_locked > 0 {
        println!("Skipped (in use): {}", report.skipped_locked);
    }
    for error in &report.errors {
        eprintln!("  error: {}", error);
    }
    Ok(())
}

fn cmd_doctor(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("repocache System Check\n");

    let git_ok = std::process::Command::new("git")
        .args(["--version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        if git_ok { "available" } else { "not found" }
    );

    let paths = CachePaths::new(&config.repository.storage_path);
    let storage_ok = check_dir("Storage dir", paths.storage_root());
    let locks_ok = check_dir("Lock dir", paths.locks_dir());

    println!(
        "[INFO] Cleanup: {}",
        if config.cleanup.enabled {
            format!(
                "every {}h, retention {} days, cap {} GB",
                config.cleanup.interval_hours,
                config.cleanup.retention_days,
                config.cleanup.max_storage_gb
            )
        } else {
            "disabled".to_string()
        }
    );

    if !git_ok || !storage_ok || !locks_ok {
        std::process::exit(1);
    }

    Ok(())
}

/// Report whether `dir` exists and is writable, creating it if missing.
fn check_dir(label: &str, dir: &Path) -> bool {
    let result = std::fs::create_dir_all(dir).and_then(|()| {
        let probe = dir.join(format!(".doctor-{}", std::process::id()));
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(&probe)
    });
    match result {
        Ok(()) => {
            println!("[OK] {}: {}", label, dir.display());
            true
        }
        Err(e) => {
            println!("[FAIL] {}: {} ({})", label, dir.display(), e);
            false
        }
    }
}

fn short_commit(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string())
}
