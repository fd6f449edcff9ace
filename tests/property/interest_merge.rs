// Test-specific lint overrides for property tests.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_docs_in_private_items)]

//! Property tests for merging presence interest lists.
//!
//! Uses proptest to verify, for arbitrary lists and caps:
//! 1. Every high-priority id is subscribed, whatever the caps.
//! 2. Low-priority ids never exceed their cap nor push the total past the
//!    global cap.
//! 3. High-priority ids lead the merged set, each group is sorted and
//!    nothing is duplicated.
//! 4. When the budget allows, nothing is dropped.

use std::collections::BTreeSet;
use std::time::Duration;

use courtside::presence::interest::{InterestConfig, Priority, merge_interest};
use courtside_proto::message::UserId;
use proptest::prelude::*;

fn arb_ids() -> impl Strategy<Value = Vec<UserId>> {
    prop::collection::vec("u[0-9]{1,2}".prop_map(UserId::new), 0..40)
}

fn arb_lists() -> impl Strategy<Value = Vec<(Priority, Vec<UserId>)>> {
    prop::collection::vec(
        (prop_oneof![Just(Priority::High), Just(Priority::Low)], arb_ids()),
        0..6,
    )
}

fn arb_config() -> impl Strategy<Value = InterestConfig> {
    (0usize..30, 0usize..60).prop_map(|(low_priority_cap, total_cap)| InterestConfig {
        debounce: Duration::from_millis(400),
        low_priority_cap,
        total_cap,
    })
}

fn ids_of(lists: &[(Priority, Vec<UserId>)], priority: Priority) -> BTreeSet<UserId> {
    lists
        .iter()
        .filter(|(p, _)| *p == priority)
        .flat_map(|(_, ids)| ids.iter().cloned())
        .collect()
}

fn merge(lists: &[(Priority, Vec<UserId>)], config: &InterestConfig) -> Vec<UserId> {
    let borrowed: Vec<(Priority, &[UserId])> =
        lists.iter().map(|(p, ids)| (*p, ids.as_slice())).collect();
    merge_interest(borrowed, config)
}

proptest! {
    #[test]
    fn high_priority_ids_are_always_included(lists in arb_lists(), config in arb_config()) {
        let merged: BTreeSet<UserId> = merge(&lists, &config).into_iter().collect();
        for id in ids_of(&lists, Priority::High) {
            prop_assert!(merged.contains(&id), "missing high-priority id {}", id);
        }
    }

    #[test]
    fn low_priority_ids_respect_both_caps(lists in arb_lists(), config in arb_config()) {
        let high = ids_of(&lists, Priority::High);
        let merged = merge(&lists, &config);
        let low_count = merged.iter().filter(|id| !high.contains(*id)).count();

        prop_assert!(low_count <= config.low_priority_cap);
        if low_count > 0 {
            prop_assert!(merged.len() <= config.total_cap);
        }
    }

    #[test]
    fn high_priority_group_leads_and_groups_are_sorted(
        lists in arb_lists(),
        config in arb_config(),
    ) {
        let merged = merge(&lists, &config);
        let high_count = ids_of(&lists, Priority::High).len();
        let (high, low) = merged.split_at(high_count);

        let high_ids = ids_of(&lists, Priority::High);
        prop_assert!(high.iter().all(|id| high_ids.contains(id)));
        prop_assert!(high.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(low.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(low.iter().all(|id| !high_ids.contains(id)));
    }

    #[test]
    fn nothing_is_dropped_within_budget(lists in arb_lists()) {
        let config = InterestConfig {
            low_priority_cap: 1000,
            total_cap: 3000,
            ..InterestConfig::default()
        };
        let mut expected = ids_of(&lists, Priority::High);
        expected.extend(ids_of(&lists, Priority::Low));

        let merged: BTreeSet<UserId> = merge(&lists, &config).into_iter().collect();
        prop_assert_eq!(merged, expected);
    }
}
