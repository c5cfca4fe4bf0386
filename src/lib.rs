//! # snapvault
//!
//! Core engine of an rsync-style snapshot backup tool: dated, hardlink
//! deduplicated snapshot directories with tiered retention, per-file
//! checksum verification, and a cycle orchestrator that drives the whole
//! thing.
//!
//! ## Features
//!
//! - **Hardlinked snapshots**: every backup is a full directory tree, but
//!   unchanged files share inodes with the previous snapshot
//! - **Tiered retention**: keep the N most recent snapshots plus daily,
//!   monthly, and yearly calendar representatives, each tier independent
//! - **Checksum ledger**: per-file SHA-256 records written at backup time
//!   and re-checked on an interval to catch bitrot
//! - **Crash safety**: transfers stage into `incomplete-*` directories and
//!   are promoted by a single atomic rename; interrupted transfers resume
//! - **Pluggable seams**: the data mover and the report channel are traits
//!   ([`Transport`], [`Reporter`]) with rsync and logging implementations
//!   built in
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use snapvault::{ConfigSet, LogReporter, Orchestrator, RsyncTransport};
//! use std::path::Path;
//!
//! # fn main() -> snapvault::Result<()> {
//! let config = ConfigSet::load(
//!     Path::new("/etc/snapvault/global.conf"),
//!     Path::new("/etc/snapvault/home.conf"),
//! )?;
//! let orchestrator =
//!     Orchestrator::new(config.settings()?, RsyncTransport, LogReporter)?;
//! let result = orchestrator.run_cycle();
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod retention;
pub mod store;
pub mod types;
pub mod utils;
pub mod verify;

pub use config::{ConfigSet, IniDocument, Settings, TransferMode, TransferSettings};
pub use error::{Result, VaultError};
pub use ledger::{ChecksumLedger, ChecksumRecord, VerificationResult};
pub use orchestrator::{
    CyclePhase, LogReporter, Orchestrator, Reporter, RsyncTransport, SummaryEntry, Transport,
};
pub use retention::{select_for_deletion, RotationOutcome};
pub use store::{LabelLock, PendingSnapshot, SnapshotStore};
pub use types::{
    CycleResult, CycleStatus, RetentionPolicy, Snapshot, SnapshotId, SnapshotStatus,
    TransferStats,
};
pub use verify::VerificationScheduler;
