//! Verification scheduler
//!
//! Periodically re-checks archived data against the checksum ledger. The
//! scheduler persists `last_verification_run` as a plain timestamp file in
//! the label's cache directory and fires when at least the configured
//! number of days has passed. An interval of `0` disables verification
//! entirely.
//!
//! Only the single most recent complete snapshot is scanned per run. This
//! is deliberate: unchanged files are shared by inode across snapshots, so
//! corruption found in the newest snapshot's shared files implies the same
//! corruption is reachable from older snapshots, and re-scanning the full
//! history adds nothing in the common case.
//!
//! A mismatch marks the snapshot `corrupt` and is surfaced in the cycle
//! report. It is never auto-repaired and never triggers deletion; throwing
//! away corrupt-but-possibly-recoverable data is not an acceptable failure
//! mode for a backup tool.

use crate::error::Result;
use crate::ledger::{ChecksumLedger, VerificationResult};
use crate::store::SnapshotStore;
use crate::types::{Snapshot, SnapshotStatus};
use crate::utils;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

/// Name of the persisted scheduler state file
const LAST_VERIFICATION_FILE: &str = "last_verification";

/// Interval-gated driver of checksum re-verification
///
/// Holds explicit handles to the store and ledger; all persistent state
/// lives in the label's cache directory, never in process-wide globals.
#[derive(Debug, Clone)]
pub struct VerificationScheduler {
    store: SnapshotStore,
    ledger: ChecksumLedger,
    interval_days: u32,
}

impl VerificationScheduler {
    /// Create a scheduler with the configured interval (0 = disabled)
    pub fn new(store: SnapshotStore, ledger: ChecksumLedger, interval_days: u32) -> Self {
        Self {
            store,
            ledger,
            interval_days,
        }
    }

    fn state_file(&self, label: &str) -> PathBuf {
        self.store.cache_dir(label).join(LAST_VERIFICATION_FILE)
    }

    /// When verification last ran for a label
    pub fn last_run(&self, label: &str) -> Result<Option<DateTime<Utc>>> {
        utils::read_timestamp_file(&self.state_file(label))
    }

    /// Select the snapshot due for verification, if any
    ///
    /// Returns `None` when verification is disabled, not yet due, or when
    /// the label has no complete snapshot. On the very first call for a
    /// label the timestamp is initialized without scanning; the snapshot
    /// just transferred was already covered by the transport's own
    /// integrity checking.
    pub fn select_due(&self, label: &str, now: DateTime<Utc>) -> Result<Option<Snapshot>> {
        if self.interval_days == 0 {
            warn!("Automatic backup verification is disabled. This is NOT recommended!");
            return Ok(None);
        }

        let Some(last_run) = self.last_run(label)? else {
            utils::write_timestamp_file(&self.state_file(label), now)?;
            return Ok(None);
        };

        let days_since = (now - last_run).num_days();
        if days_since < self.interval_days as i64 {
            return Ok(None);
        }

        info!(
            "At least {} days have passed since the backup was last verified. \
             Initializing verification...",
            self.interval_days
        );
        self.store.latest(label)
    }

    /// Run a scheduled verification pass if one is due
    ///
    /// After scanning, `last_verification_run` is updated regardless of
    /// whether mismatches were found; a persistently corrupt file must not
    /// force a full re-scan on every subsequent cycle. The timestamp is
    /// left untouched when the scan itself could not run (for example a
    /// missing ledger), so the attempt repeats next cycle.
    pub fn run_if_due(
        &self,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<VerificationResult>> {
        let Some(mut snapshot) = self.select_due(label, now)? else {
            return Ok(None);
        };

        let result = self.verify_snapshot(&mut snapshot, now)?;
        utils::write_timestamp_file(&self.state_file(label), now)?;
        Ok(Some(result))
    }

    /// Compare one snapshot against its ledger and update its status
    ///
    /// Used by the scheduled path and by explicit operator-driven
    /// verification; the schedule timestamp is not touched here.
    pub fn verify_snapshot(
        &self,
        snapshot: &mut Snapshot,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult> {
        info!("Starting checksum verification for {:?}", snapshot.path);
        let result = self.ledger.compare(snapshot)?;

        let status = if result.is_clean() {
            SnapshotStatus::Verified
        } else {
            warn!("Backup verification failed: {}", result.summary());
            SnapshotStatus::Corrupt
        };
        self.store.set_status(snapshot, status, Some(now))?;

        Ok(result)
    }
}
