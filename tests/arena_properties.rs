//! Property suites for the boundary-tag arena.

mod common;

use std::sync::OnceLock;

use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use strata::arena::ArenaOptions;
use strata::mem::PAGE_SIZE;
use strata::{Allocation, AllocationPolicy, Arena, MetadataCaches};

static METADATA: OnceLock<&'static MetadataCaches> = OnceLock::new();

fn metadata() -> &'static MetadataCaches {
    METADATA.get_or_init(|| common::metadata_over_pool(512 * PAGE_SIZE).0)
}

fn policy_for(index: usize) -> AllocationPolicy {
    [
        AllocationPolicy::InstantFit,
        AllocationPolicy::BestFit,
        AllocationPolicy::FirstFit,
    ][index % 3]
}

const SPAN_BYTES: usize = 0x10000;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Free plus allocated bytes equal the span total at every quiescent
    /// point, under every policy.
    #[test]
    fn conservation_holds(
        ops in prop::collection::vec((1usize..=64, any::<bool>(), 0usize..3), 1..80),
    ) {
        let arena = Arena::new(
            "prop-conservation",
            0x10,
            metadata(),
            ArenaOptions::default(),
        )
        .unwrap();
        arena.add_span(0, SPAN_BYTES).unwrap();

        let mut live: Vec<Allocation> = Vec::new();
        for (quanta, free_first, policy_index) in ops {
            if free_first && !live.is_empty() {
                let victim = live.swap_remove(quanta % live.len());
                arena.deallocate(victim);
            }
            if let Ok(allocation) = arena.allocate(quanta * 0x10, policy_for(policy_index)) {
                prop_assert_eq!(allocation.len, quanta * 0x10);
                live.push(allocation);
            }

            let stats = arena.stats();
            prop_assert_eq!(stats.free_bytes + stats.allocated_bytes, SPAN_BYTES);
            prop_assert_eq!(stats.allocation_count, live.len());
        }
        arena.verify_invariants();

        for allocation in live.drain(..) {
            arena.deallocate(allocation);
        }
        let stats = arena.stats();
        prop_assert_eq!(stats.free_bytes, SPAN_BYTES);
        prop_assert_eq!(stats.free_tag_count, 1);
        arena.verify_invariants();
        arena.deinit();
    }

    /// Any allocation pattern can be freed in any order and reallocated
    /// with the same lengths.
    #[test]
    fn random_free_order_round_trips(
        sizes in prop::collection::vec(1usize..=64, 1..40),
        seed in any::<u64>(),
    ) {
        let arena = Arena::new(
            "prop-round-trip",
            0x10,
            metadata(),
            ArenaOptions::default(),
        )
        .unwrap();
        arena.add_span(0x8000, SPAN_BYTES).unwrap();

        let mut first: Vec<Allocation> = sizes
            .iter()
            .map(|quanta| arena.allocate(quanta * 0x10, AllocationPolicy::InstantFit).unwrap())
            .collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        first.shuffle(&mut rng);
        for allocation in first {
            arena.deallocate(allocation);
        }
        arena.verify_invariants();

        // The arena is whole again; the same lengths fit again.
        let second: Vec<Allocation> = sizes
            .iter()
            .map(|quanta| arena.allocate(quanta * 0x10, AllocationPolicy::InstantFit).unwrap())
            .collect();
        for (quanta, allocation) in sizes.iter().zip(&second) {
            prop_assert_eq!(allocation.len, quanta * 0x10);
        }
        for allocation in second {
            arena.deallocate(allocation);
        }

        let stats = arena.stats();
        prop_assert_eq!(stats.free_tag_count, 1);
        prop_assert_eq!(stats.freelist_bitmap.count_ones(), 1);
        arena.deinit();
    }
}
