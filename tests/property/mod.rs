//! Property-based tests for the retention engine
//!
//! Uses proptest to check the retention invariants across randomly
//! generated snapshot histories and policies: the newest snapshot always
//! survives, count-tier snapshots are untouchable, calendar buckets keep
//! their latest representative, and re-applying a policy to the survivors
//! deletes nothing further.

use chrono::{Datelike, TimeZone, Utc};
use proptest::prelude::*;
use snapvault::retention::select_for_deletion;
use snapvault::{RetentionPolicy, SnapshotId};
use std::collections::BTreeSet;

/// Random snapshot ids spread across a few years of history
fn id_strategy() -> impl Strategy<Value = SnapshotId> {
    (2020i32..2026, 1u32..13, 1u32..29, 0u32..24, 0u32..60).prop_map(
        |(year, month, day, hour, minute)| {
            SnapshotId::from_timestamp(
                Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
                    .single()
                    .expect("generated timestamp is valid"),
            )
        },
    )
}

fn history_strategy() -> impl Strategy<Value = Vec<SnapshotId>> {
    prop::collection::vec(id_strategy(), 1..40)
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (0u32..6, 0u32..10, 0u32..6, 0u32..4).prop_map(|(snapshot, daily, monthly, yearly)| {
        RetentionPolicy {
            snapshot,
            daily,
            monthly,
            yearly,
        }
    })
}

fn unique_newest_first(ids: &[SnapshotId]) -> Vec<SnapshotId> {
    let mut sorted: Vec<SnapshotId> = ids.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();
    sorted
}

proptest! {
    #[test]
    fn prop_newest_snapshot_always_survives(
        ids in history_strategy(),
        policy in policy_strategy(),
    ) {
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        let newest = *unique_newest_first(&ids).first().unwrap();
        prop_assert!(!doomed.contains(&newest));
    }

    #[test]
    fn prop_deletion_set_is_subset_of_input(
        ids in history_strategy(),
        policy in policy_strategy(),
    ) {
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        let all: BTreeSet<SnapshotId> = ids.iter().copied().collect();
        prop_assert!(doomed.is_subset(&all));
        prop_assert!(doomed.len() < all.len());
    }

    #[test]
    fn prop_count_tier_snapshots_are_untouchable(
        ids in history_strategy(),
        policy in policy_strategy(),
    ) {
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        for id in unique_newest_first(&ids).iter().take(policy.snapshot as usize) {
            prop_assert!(!doomed.contains(id), "count tier lost {}", id);
        }
    }

    #[test]
    fn prop_count_tier_alone_keeps_exactly_n(
        ids in history_strategy(),
        n in 0u32..8,
    ) {
        let policy = RetentionPolicy { snapshot: n, ..Default::default() };
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        let unique = unique_newest_first(&ids);

        // The safety floor guarantees one survivor even with n = 0
        let expected = (n.max(1) as usize).min(unique.len());
        prop_assert_eq!(unique.len() - doomed.len(), expected);
    }

    #[test]
    fn prop_daily_buckets_keep_latest_representative(
        ids in history_strategy(),
        daily in 1u32..10,
    ) {
        let policy = RetentionPolicy { daily, ..Default::default() };
        let doomed = select_for_deletion(&ids, &policy).unwrap();

        let mut days_seen = Vec::new();
        for id in unique_newest_first(&ids) {
            let day = id.created_at().date_naive();
            if days_seen.last() != Some(&day) {
                if days_seen.len() == daily as usize {
                    break;
                }
                days_seen.push(day);
                // First id of a new day in newest-first order is that
                // day's latest snapshot.
                prop_assert!(!doomed.contains(&id), "daily tier lost {}", id);
            }
        }
    }

    #[test]
    fn prop_yearly_buckets_keep_latest_representative(
        ids in history_strategy(),
        yearly in 1u32..4,
    ) {
        let policy = RetentionPolicy { yearly, ..Default::default() };
        let doomed = select_for_deletion(&ids, &policy).unwrap();

        let mut years_seen = Vec::new();
        for id in unique_newest_first(&ids) {
            let year = id.created_at().year();
            if years_seen.last() != Some(&year) {
                if years_seen.len() == yearly as usize {
                    break;
                }
                years_seen.push(year);
                prop_assert!(!doomed.contains(&id), "yearly tier lost {}", id);
            }
        }
    }

    #[test]
    fn prop_selection_is_idempotent(
        ids in history_strategy(),
        policy in policy_strategy(),
    ) {
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        let survivors: Vec<SnapshotId> = unique_newest_first(&ids)
            .into_iter()
            .filter(|id| !doomed.contains(id))
            .collect();

        let second_pass = select_for_deletion(&survivors, &policy).unwrap();
        prop_assert!(
            second_pass.is_empty(),
            "second pass wanted to delete {:?}",
            second_pass
        );
    }

    #[test]
    fn prop_all_disabled_keeps_exactly_the_newest(
        ids in history_strategy(),
    ) {
        let policy = RetentionPolicy::default();
        let doomed = select_for_deletion(&ids, &policy).unwrap();
        let unique = unique_newest_first(&ids);
        prop_assert_eq!(doomed.len(), unique.len() - 1);
        prop_assert!(!doomed.contains(&unique[0]));
    }

    #[test]
    fn prop_wider_window_never_deletes_more(
        ids in history_strategy(),
        daily in 1u32..8,
    ) {
        let narrow = RetentionPolicy { daily, ..Default::default() };
        let wide = RetentionPolicy { daily: daily + 1, ..Default::default() };

        let narrow_doomed = select_for_deletion(&ids, &narrow).unwrap();
        let wide_doomed = select_for_deletion(&ids, &wide).unwrap();
        prop_assert!(wide_doomed.is_subset(&narrow_doomed));
    }
}
