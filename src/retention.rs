//! Tiered retention engine
//!
//! Decides which snapshots are eligible for deletion after a cycle. The
//! four tiers (snapshot count, calendar day, calendar month, calendar
//! year) are evaluated as independent pure functions over snapshot ids and
//! composed by set union: a snapshot is deleted only when *no* enabled
//! tier needs it.
//!
//! Bucketing uses the timestamp encoded in each [`SnapshotId`], never the
//! wall clock at evaluation time, so a run exactly at midnight belongs to
//! the new day. Within a bucket the chronologically latest snapshot is the
//! kept representative.
//!
//! Two hard rules sit above the tiers:
//!
//! - the most recent snapshot overall is never deleted, even when no tier
//!   would retain it (safety floor)
//! - deletion is best-effort per snapshot; one failure is collected and
//!   reported without aborting the remaining candidates

use crate::error::{Result, VaultError};
use crate::store::SnapshotStore;
use crate::types::{DeletionFailure, RetentionPolicy, Snapshot, SnapshotId};
use chrono::Datelike;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// One retention tier with its configured window
///
/// Tagged variants keep the tiers independently testable; the engine
/// evaluates each and merges the "needed" sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Keep the N most recent snapshots outright
    Snapshot(u32),
    /// Keep one representative for each of the N most recent calendar days
    Daily(u32),
    /// Keep one representative for each of the N most recent calendar months
    Monthly(u32),
    /// Keep one representative for each of the N most recent calendar years
    Yearly(u32),
}

impl Tier {
    /// Expand a policy into its enabled tiers
    pub fn enabled(policy: &RetentionPolicy) -> Vec<Tier> {
        let all = [
            Tier::Snapshot(policy.snapshot),
            Tier::Daily(policy.daily),
            Tier::Monthly(policy.monthly),
            Tier::Yearly(policy.yearly),
        ];
        all.into_iter().filter(|t| t.window() > 0).collect()
    }

    fn window(&self) -> u32 {
        match self {
            Tier::Snapshot(n) | Tier::Daily(n) | Tier::Monthly(n) | Tier::Yearly(n) => *n,
        }
    }

    /// Snapshots this tier needs, given all ids newest first
    fn needed(&self, newest_first: &[SnapshotId]) -> BTreeSet<SnapshotId> {
        match self {
            Tier::Snapshot(n) => newest_first.iter().take(*n as usize).copied().collect(),
            Tier::Daily(n) => keep_bucket_representatives(newest_first, *n, |id| {
                let d = id.created_at().date_naive();
                (d.year(), d.ordinal(), 0)
            }),
            Tier::Monthly(n) => keep_bucket_representatives(newest_first, *n, |id| {
                let d = id.created_at().date_naive();
                (d.year(), d.month(), 0)
            }),
            Tier::Yearly(n) => keep_bucket_representatives(newest_first, *n, |id| {
                (id.created_at().year(), 0, 0)
            }),
        }
    }
}

/// Keep the newest snapshot of each of the `limit` most recent buckets
///
/// `newest_first` ordering makes the first id seen in a bucket the
/// chronologically latest one, which is exactly the tie-break rule.
fn keep_bucket_representatives<K: PartialEq + Copy>(
    newest_first: &[SnapshotId],
    limit: u32,
    bucket_of: impl Fn(&SnapshotId) -> K,
) -> BTreeSet<SnapshotId> {
    let mut kept = BTreeSet::new();
    let mut current_bucket: Option<K> = None;
    let mut buckets_used = 0u32;

    for id in newest_first {
        let bucket = bucket_of(id);
        if current_bucket != Some(bucket) {
            if buckets_used == limit {
                break;
            }
            current_bucket = Some(bucket);
            buckets_used += 1;
            kept.insert(*id);
        }
        // Older snapshots in an already-represented bucket are not needed
        // by this tier.
    }

    kept
}

/// Select the snapshots eligible for deletion under a policy
///
/// `ids` are the complete snapshots of one label, in any order. The
/// returned set is the complement of the union of per-tier needs, with the
/// newest snapshot unconditionally excluded. Evaluating twice without new
/// snapshots deletes nothing further (idempotence).
pub fn select_for_deletion(
    ids: &[SnapshotId],
    policy: &RetentionPolicy,
) -> Result<BTreeSet<SnapshotId>> {
    policy.validate()?;

    let mut newest_first: Vec<SnapshotId> = ids.to_vec();
    newest_first.sort_unstable_by(|a, b| b.cmp(a));
    newest_first.dedup();

    let Some(&newest) = newest_first.first() else {
        return Ok(BTreeSet::new());
    };

    let mut needed = BTreeSet::new();
    for tier in Tier::enabled(policy) {
        let tier_needed = tier.needed(&newest_first);
        debug!("{:?} retains {} snapshot(s)", tier, tier_needed.len());
        needed.extend(tier_needed);
    }

    // Safety floor: the latest snapshot survives every policy.
    needed.insert(newest);

    Ok(newest_first
        .into_iter()
        .filter(|id| !needed.contains(id))
        .collect())
}

/// Result of one rotation pass
#[derive(Debug, Default, Clone)]
pub struct RotationOutcome {
    /// Snapshots fully removed
    pub deleted: Vec<SnapshotId>,
    /// Deletions that failed, collected per snapshot
    pub failures: Vec<DeletionFailure>,
}

/// Apply a retention policy to a label: select and delete
///
/// Deletion of each candidate is independent; a failure is recorded in the
/// outcome and processing continues. The checksum ledger lives inside the
/// snapshot directory, so removing the directory cascades it away.
pub fn rotate(
    store: &SnapshotStore,
    label: &str,
    policy: &RetentionPolicy,
) -> Result<RotationOutcome> {
    let snapshots: Vec<Snapshot> = store
        .list(label)?
        .into_iter()
        .filter(|s| s.status.is_complete())
        .collect();
    let ids: Vec<SnapshotId> = snapshots.iter().map(|s| s.id).collect();
    let doomed = select_for_deletion(&ids, policy)?;

    if doomed.is_empty() {
        debug!("Retention for '{}': nothing to delete", label);
        return Ok(RotationOutcome::default());
    }
    info!(
        "Retention for '{}': deleting {} of {} snapshot(s)",
        label,
        doomed.len(),
        ids.len()
    );

    let mut outcome = RotationOutcome::default();
    // Oldest first, so a partial failure leaves the most recent history.
    for snapshot in doomed
        .iter()
        .filter_map(|id| snapshots.iter().find(|s| s.id == *id))
    {
        match store.delete(snapshot) {
            Ok(()) => outcome.deleted.push(snapshot.id),
            Err(VaultError::Deletion { id, reason }) => {
                warn!("Deletion of {} failed: {}", id, reason);
                outcome.failures.push(DeletionFailure {
                    id: snapshot.id,
                    reason,
                });
            }
            Err(e) => {
                warn!("Deletion of {} failed: {}", snapshot.id, e);
                outcome.failures.push(DeletionFailure {
                    id: snapshot.id,
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(outcome)
}
