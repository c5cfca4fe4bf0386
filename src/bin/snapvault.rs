//! # snapvault CLI
//!
//! Command-line front end for the snapvault backup engine.
//!
//! ## Usage
//! ```bash
//! # Run one full backup cycle for a label
//! snapvault -c /etc/snapvault/global.conf -l /etc/snapvault/home.conf run
//!
//! # List snapshots
//! snapvault -c global.conf -l home.conf list
//!
//! # Verify the latest snapshot right now
//! snapvault -c global.conf -l home.conf verify
//!
//! # Apply retention without backing up
//! snapvault -c global.conf -l home.conf prune --dry-run
//!
//! # Remove abandoned staging directories
//! snapvault -c global.conf -l home.conf gc
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use humantime::format_duration;
use snapvault::{
    retention, ChecksumLedger, ConfigSet, CycleStatus, LogReporter, Orchestrator, Result,
    RsyncTransport, Settings, SnapshotStore, VerificationScheduler,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// snapvault - hardlink-deduplicated snapshot backups with tiered retention
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Global configuration file
    #[arg(short = 'c', long, global = true, default_value = "/etc/snapvault/global.conf")]
    config: PathBuf,

    /// Label configuration file
    #[arg(short = 'l', long, global = true)]
    label_config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full backup cycle (transfer, rotate, verify, report)
    Run,

    /// List snapshots for the label
    #[command(alias = "ls")]
    List,

    /// Verify a snapshot against its checksum ledger
    Verify {
        /// Snapshot id (defaults to the latest complete snapshot)
        snapshot: Option<String>,
    },

    /// Apply the retention policy without running a backup
    Prune {
        /// Compute the deletion set but delete nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove abandoned staging directories
    Gc,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = ConfigSet::load(&cli.config, &cli.label_config)
        .with_context(|| format!("loading configuration from {:?}", cli.config))?
        .settings()?;

    match cli.command {
        Commands::Run => cmd_run(settings)?,
        Commands::List => cmd_list(settings)?,
        Commands::Verify { snapshot } => cmd_verify(settings, snapshot)?,
        Commands::Prune { dry_run } => cmd_prune(settings, dry_run)?,
        Commands::Gc => cmd_gc(settings)?,
    }
    Ok(())
}

fn cmd_run(settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings, RsyncTransport, LogReporter)?;
    let result = orchestrator.run_cycle();

    println!("{}", result.summary());
    println!(
        "  duration: {}",
        format_duration(Duration::from_millis(result.duration_ms))
    );
    if let Some(log) = &result.log_path {
        println!("  log: {}", log.display());
    }

    match result.status {
        CycleStatus::Failed => std::process::exit(1),
        CycleStatus::Partial => std::process::exit(2),
        CycleStatus::Success => Ok(()),
    }
}

fn cmd_list(settings: Settings) -> Result<()> {
    let store = SnapshotStore::open(&settings.backup_root)?;
    let snapshots = store.list(&settings.label)?;

    if snapshots.is_empty() {
        println!("No snapshots for label '{}'", settings.label);
        return Ok(());
    }

    println!("Snapshots for '{}':", settings.label);
    for snapshot in &snapshots {
        let verified = snapshot
            .last_verified_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {}  {:<11}  verified: {}",
            snapshot.id, snapshot.status, verified
        );
    }
    if let Some(staging) = store.find_staging_dir(&settings.label)? {
        println!("  incomplete staging directory: {}", staging.display());
    }
    Ok(())
}

fn cmd_verify(settings: Settings, snapshot: Option<String>) -> Result<()> {
    let store = SnapshotStore::open(&settings.backup_root)?;
    let scheduler = VerificationScheduler::new(
        store.clone(),
        ChecksumLedger::new(),
        settings.verification_interval_days,
    );

    let mut target = match snapshot {
        Some(id) => store.get(&settings.label, id.parse()?)?,
        None => match store.latest(&settings.label)? {
            Some(s) => s,
            None => {
                println!("No snapshot to verify for label '{}'", settings.label);
                return Ok(());
            }
        },
    };

    let result = scheduler.verify_snapshot(&mut target, chrono::Utc::now())?;
    println!("{}", result.summary());
    if !result.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_prune(settings: Settings, dry_run: bool) -> Result<()> {
    let store = SnapshotStore::open(&settings.backup_root)?;
    let _guard = store.lock(&settings.label)?;

    if dry_run {
        let snapshots = store.list(&settings.label)?;
        let ids: Vec<_> = snapshots
            .iter()
            .filter(|s| s.status.is_complete())
            .map(|s| s.id)
            .collect();
        let doomed = retention::select_for_deletion(&ids, &settings.retention)?;
        if doomed.is_empty() {
            println!("Nothing to delete");
        } else {
            println!("Would delete {} snapshot(s):", doomed.len());
            for id in doomed {
                println!("  {}", id);
            }
        }
        return Ok(());
    }

    let outcome = retention::rotate(&store, &settings.label, &settings.retention)?;
    println!("Deleted {} snapshot(s)", outcome.deleted.len());
    for failure in &outcome.failures {
        eprintln!("  failed to delete {}: {}", failure.id, failure.reason);
    }
    if !outcome.failures.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_gc(settings: Settings) -> Result<()> {
    let store = SnapshotStore::open(&settings.backup_root)?;
    let _guard = store.lock(&settings.label)?;

    let collected = store.gc(&settings.label)?;
    if collected.is_empty() {
        println!("Nothing to collect");
    } else {
        for id in collected {
            println!("Removed staging directory for {}", id);
        }
    }
    Ok(())
}
