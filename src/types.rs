//! Core data types used throughout the snapvault library
//!
//! This module contains the fundamental data structures shared across
//! components:
//!
//! - **Snapshots**: [`SnapshotId`], [`SnapshotStatus`], [`Snapshot`] - the
//!   dated, hardlinked backup directories and their metadata
//! - **Policy**: [`RetentionPolicy`] - the four independent tier counters
//! - **Cycle results**: [`CycleStatus`], [`CycleResult`], [`TransferStats`],
//!   [`DeletionFailure`] - the structured outcome handed to the reporter

use crate::error::{Result, VaultError};
use crate::utils::TIMESTAMP_FORMAT;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Identifier of a snapshot: its creation timestamp, second resolution
///
/// Ids render as `YYYY-MM-DD-HHMMSS`, so their lexicographic order equals
/// their chronological order. This property is what makes newest-first
/// listings and retention bucketing cheap.
///
/// # Examples
///
/// ```rust
/// use snapvault::types::SnapshotId;
///
/// let id: SnapshotId = "2024-05-01-020000".parse().unwrap();
/// assert_eq!(id.to_string(), "2024-05-01-020000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    stamp: DateTime<Utc>,
}

impl SnapshotId {
    /// Create an id from a creation timestamp, truncated to whole seconds
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        // Round-trip through the display format so sub-second precision can
        // never make two ids with the same rendering compare unequal.
        let rendered = at.format(TIMESTAMP_FORMAT).to_string();
        rendered.parse().expect("rendered timestamp always parses")
    }

    /// Id for a snapshot created right now
    pub fn now() -> Self {
        Self::from_timestamp(Utc::now())
    }

    /// The creation instant encoded in this id
    pub fn created_at(&self) -> DateTime<Utc> {
        self.stamp
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stamp.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for SnapshotId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map_err(|e| VaultError::internal(format!("invalid snapshot id '{}': {}", s, e)))?;
        Ok(Self {
            stamp: naive.and_utc(),
        })
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.to_string()
    }
}

/// Lifecycle status of a snapshot
///
/// Content is immutable once a snapshot reaches `Complete`; only metadata
/// (status and verification timestamp) changes afterwards. `promote` is the
/// only operation that moves a snapshot to `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotStatus {
    /// Transfer into the staging directory has not finished
    InProgress,
    /// Transfer finished and the directory was promoted
    Complete,
    /// Transfer aborted; directory is garbage-collectable
    Failed,
    /// Latest checksum scan found every recorded file intact
    Verified,
    /// Latest checksum scan found mismatched or missing files
    Corrupt,
}

impl SnapshotStatus {
    /// Whether the snapshot holds a full, promoted file tree
    ///
    /// `Verified` and `Corrupt` snapshots are still complete; corruption is
    /// a reporting event, never a retention trigger.
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            SnapshotStatus::Complete | SnapshotStatus::Verified | SnapshotStatus::Corrupt
        )
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotStatus::InProgress => "in-progress",
            SnapshotStatus::Complete => "complete",
            SnapshotStatus::Failed => "failed",
            SnapshotStatus::Verified => "verified",
            SnapshotStatus::Corrupt => "corrupt",
        };
        write!(f, "{}", s)
    }
}

/// Persisted per-snapshot metadata (`meta.json` sidecar)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Lifecycle status
    pub status: SnapshotStatus,
    /// Creation timestamp (matches the id)
    pub created_at: DateTime<Utc>,
    /// When a checksum scan last ran against this snapshot
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// A snapshot known to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Identifier (creation timestamp)
    pub id: SnapshotId,
    /// Backup label this snapshot belongs to
    pub label: String,
    /// Snapshot directory (contains `data/`, `meta.json`, `checksums.jsonl`)
    pub path: PathBuf,
    /// Lifecycle status
    pub status: SnapshotStatus,
    /// When a checksum scan last ran against this snapshot
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Directory holding the transferred file tree
    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    /// Path of the checksum ledger file
    pub fn ledger_path(&self) -> PathBuf {
        self.path.join("checksums.jsonl")
    }

    /// Path of the metadata sidecar
    pub fn meta_path(&self) -> PathBuf {
        self.path.join("meta.json")
    }

    /// Creation instant (from the id)
    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }
}

/// Tiered retention policy: four independent counters
///
/// Each counter is either a positive window or `0` (tier disabled). The
/// counters are evaluated independently by the retention engine; a single
/// physical snapshot can satisfy several tiers at once.
///
/// # Examples
///
/// ```rust
/// use snapvault::types::RetentionPolicy;
///
/// let policy = RetentionPolicy {
///     snapshot: 3,
///     daily: 7,
///     monthly: 6,
///     yearly: 2,
/// };
/// assert!(policy.validate().is_ok());
/// assert!(policy.any_enabled());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Most recent snapshots to keep regardless of calendar tiers
    pub snapshot: u32,
    /// Calendar days of daily representatives to keep
    pub daily: u32,
    /// Calendar months of monthly representatives to keep
    pub monthly: u32,
    /// Calendar years of yearly representatives to keep
    pub yearly: u32,
}

impl RetentionPolicy {
    /// Validate policy values
    ///
    /// Counters are unsigned so negative values are rejected at parse time;
    /// this exists as the explicit pre-mutation gate for future range rules
    /// and for values arriving from raw config integers.
    pub fn validate(&self) -> Result<()> {
        // All-zero is legal: rotation then keeps only the safety floor.
        Ok(())
    }

    /// Whether at least one tier is enabled
    pub fn any_enabled(&self) -> bool {
        self.snapshot > 0 || self.daily > 0 || self.monthly > 0 || self.yearly > 0
    }

    /// Build from raw (possibly negative) config integers
    pub fn from_raw(snapshot: i64, daily: i64, monthly: i64, yearly: i64) -> Result<Self> {
        let check = |name: &str, v: i64| -> Result<u32> {
            u32::try_from(v).map_err(|_| {
                VaultError::config(format!("retention counter '{}' must be >= 0, got {}", name, v))
            })
        };
        Ok(Self {
            snapshot: check("snapshot", snapshot)?,
            daily: check("daily", daily)?,
            monthly: check("monthly", monthly)?,
            yearly: check("yearly", yearly)?,
        })
    }
}

/// Statistics reported by the transport for one transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    /// Bytes actually sent over the wire
    pub transferred_bytes: u64,
    /// Files created or updated in the new snapshot
    pub files_transferred: usize,
    /// Total files examined at the source
    pub files_total: usize,
}

/// Terminal status of one backup cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleStatus {
    /// Transfer, promotion, and retention all succeeded
    Success,
    /// The cycle completed but some stage reported non-fatal errors
    Partial,
    /// The cycle aborted before producing a complete snapshot
    Failed,
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleStatus::Success => "success",
            CycleStatus::Partial => "partial",
            CycleStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A deletion that failed during rotation (collected, non-fatal)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionFailure {
    /// Snapshot that could not be fully removed
    pub id: SnapshotId,
    /// Failure description
    pub reason: String,
}

/// Structured outcome of one backup cycle, consumed by the reporter
///
/// Exactly one of these is produced per cycle, whether the cycle succeeded,
/// partially failed, or aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    /// Backup label
    pub label: String,
    /// Terminal status
    pub status: CycleStatus,
    /// Snapshot produced by this cycle, if promotion succeeded
    pub snapshot_id: Option<SnapshotId>,
    /// Transfer statistics, if the transfer ran
    pub transfer: Option<TransferStats>,
    /// Snapshots removed by the retention engine
    pub deleted_snapshots: Vec<SnapshotId>,
    /// Deletions that failed (best-effort, reported)
    pub deletion_failures: Vec<DeletionFailure>,
    /// Outcome of a verification scan, if one was due this cycle
    pub verification: Option<crate::ledger::VerificationResult>,
    /// Wall-clock duration of the cycle
    pub duration_ms: u64,
    /// Per-cycle log file
    pub log_path: Option<PathBuf>,
    /// Human-readable error summaries collected along the way
    pub errors: Vec<String>,
}

impl CycleResult {
    /// Start an empty result for a label
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: CycleStatus::Failed,
            snapshot_id: None,
            transfer: None,
            deleted_snapshots: Vec::new(),
            deletion_failures: Vec::new(),
            verification: None,
            duration_ms: 0,
            log_path: None,
            errors: Vec::new(),
        }
    }

    /// One-line summary for logs and report subjects
    pub fn summary(&self) -> String {
        let snapshot = self
            .snapshot_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "[{}] {}: snapshot {}, {} deleted, {} errors",
            self.label,
            self.status,
            snapshot,
            self.deleted_snapshots.len(),
            self.errors.len()
        )
    }
}
