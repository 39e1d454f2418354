//! Property-based tests for shard partitioning.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;

use shardline_stream::coordinator::{assigned_shards, eligible_shards};
use shardline_stream::{ShardId, ShardInfo};

fn arb_shard_ids() -> impl Strategy<Value = Vec<ShardId>> {
    prop::collection::btree_set("shardId-[0-9]{6}", 0..40)
        .prop_map(|ids| ids.into_iter().map(ShardId::from).collect())
}

fn arb_shard_map() -> impl Strategy<Value = BTreeMap<ShardId, ShardInfo>> {
    prop::collection::btree_map(
        (0u8..30).prop_map(|i| ShardId::new(format!("shard-{i:02}"))),
        (any::<bool>(), prop::option::of(0u8..40)),
        0..30,
    )
    .prop_map(|shards| {
        shards
            .into_iter()
            .map(|(shard_id, (finished, parent))| {
                let info = ShardInfo {
                    finished,
                    parent_shard_id: parent.map(|i| ShardId::new(format!("shard-{i:02}"))),
                };
                (shard_id, info)
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_assignment_covers_every_shard_exactly_once(
        shard_ids in arb_shard_ids(),
        total_clients in 1usize..8,
    ) {
        let mut seen = BTreeSet::new();
        let mut assigned_count = 0;

        for client_index in 0..total_clients {
            let assigned = assigned_shards(&shard_ids, client_index, total_clients);
            assigned_count += assigned.len();
            seen.extend(assigned);
        }

        prop_assert_eq!(assigned_count, shard_ids.len());
        prop_assert_eq!(seen.into_iter().collect::<Vec<_>>(), shard_ids);
    }

    #[test]
    fn prop_assignment_is_deterministic(
        shard_ids in arb_shard_ids(),
        total_clients in 1usize..8,
    ) {
        for client_index in 0..total_clients {
            prop_assert_eq!(
                assigned_shards(&shard_ids, client_index, total_clients),
                assigned_shards(&shard_ids.clone(), client_index, total_clients)
            );
        }
    }

    #[test]
    fn prop_eligible_shards_are_sorted_and_unfinished(
        shards in arb_shard_map(),
        keep_shard_order in any::<bool>(),
    ) {
        let eligible = eligible_shards(&shards, keep_shard_order);

        prop_assert!(eligible.windows(2).all(|pair| pair[0] < pair[1]));
        for shard_id in &eligible {
            let info = &shards[shard_id];
            prop_assert!(!info.finished);

            if keep_shard_order {
                let parent_blocks = info
                    .parent_shard_id
                    .as_ref()
                    .and_then(|parent| shards.get(parent))
                    .is_some_and(|parent| !parent.finished);
                prop_assert!(!parent_blocks);
            }
        }
    }
}
