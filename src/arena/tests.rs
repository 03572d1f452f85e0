use core::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::*;
use crate::mem::PAGE_SIZE;
use crate::testutil::TestEnv;

fn env() -> TestEnv {
    TestEnv::new(64 * PAGE_SIZE, 64 * PAGE_SIZE)
}

fn plain_arena(env: &TestEnv, name: &'static str, quantum: usize) -> &'static Arena {
    env.leak_arena(name, quantum, ArenaOptions::default())
}

#[test]
fn rejects_invalid_quantum() {
    let env = env();
    for quantum in [0usize, 3, 24] {
        let result = Arena::new("bad-quantum", quantum, env.metadata(), ArenaOptions::default());
        assert!(matches!(result, Err(ArenaInitError::InvalidQuantum)));
    }
}

#[test]
fn add_span_argument_checks() {
    let env = env();
    let arena = plain_arena(&env, "span-checks", 0x10);

    assert_eq!(arena.add_span(0, 0), Err(AddSpanError::ZeroLength));
    assert_eq!(arena.add_span(0x8, 0x100), Err(AddSpanError::Unaligned));
    assert_eq!(arena.add_span(0x100, 0x18), Err(AddSpanError::Unaligned));
    assert_eq!(arena.add_span(usize::MAX - 0xf, 0x100), Err(AddSpanError::Unaligned));
    assert_eq!(
        arena.add_span(usize::MAX & !0xf, 0x100),
        Err(AddSpanError::WouldWrap)
    );

    arena.add_span(0x1000, 0x1000).unwrap();
    assert_eq!(arena.add_span(0x1800, 0x1000), Err(AddSpanError::Overlap));
    assert_eq!(arena.add_span(0x800, 0x1000), Err(AddSpanError::Overlap));
    assert_eq!(arena.add_span(0x1000, 0x1000), Err(AddSpanError::Overlap));
    // Touching is not overlapping.
    arena.add_span(0x2000, 0x1000).unwrap();
    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn zero_length_allocation_is_rejected() {
    let env = env();
    let arena = plain_arena(&env, "zero-len", 0x10);
    arena.add_span(0, 0x1000).unwrap();
    assert_eq!(
        arena.allocate(0, AllocationPolicy::InstantFit),
        Err(AllocateError::ZeroLength)
    );
    arena.deinit();
}

#[test]
fn split_and_coalesce_round_trip() {
    let env = env();
    let arena = plain_arena(&env, "split-coalesce", 0x10);
    arena.add_span(0, 0x1000).unwrap();

    let a = arena.allocate(0x30, AllocationPolicy::InstantFit).unwrap();
    let b = arena.allocate(0x40, AllocationPolicy::InstantFit).unwrap();
    let c = arena.allocate(0x50, AllocationPolicy::InstantFit).unwrap();
    assert_eq!((a.len, b.len, c.len), (0x30, 0x40, 0x50));
    arena.verify_invariants();

    let stats = arena.stats();
    assert_eq!(stats.allocated_bytes, 0xc0);
    assert_eq!(stats.free_bytes, 0x1000 - 0xc0);

    arena.deallocate(c);
    arena.verify_invariants();
    arena.deallocate(b);
    arena.verify_invariants();
    arena.deallocate(a);
    arena.verify_invariants();

    // Everything coalesced back into exactly one free tag of the original
    // length, so exactly one freelist bit survives: floor(log2(0x1000)).
    let stats = arena.stats();
    assert_eq!(stats.free_tag_count, 1);
    assert_eq!(stats.free_bytes, 0x1000);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.freelist_bitmap.count_ones(), 1);
    assert_eq!(stats.freelist_bitmap, 1 << 12);

    arena.deinit();
}

#[test]
fn conservation_across_random_operations() {
    let env = env();
    let arena = plain_arena(&env, "conservation", 0x10);
    arena.add_span(0x10_0000, 0x8000).unwrap();
    arena.add_span(0x20_0000, 0x4000).unwrap();
    let total = 0x8000 + 0x4000;

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut live = std::vec::Vec::new();
    for round in 0..200usize {
        let len = 0x10 * (1 + round % 37);
        match arena.allocate(len, AllocationPolicy::InstantFit) {
            Ok(allocation) => live.push(allocation),
            Err(AllocateError::RequestedLengthUnavailable) => {
                let victim = live.remove(round % live.len().max(1));
                arena.deallocate(victim);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
        if round % 3 == 0 && !live.is_empty() {
            let index = round % live.len();
            arena.deallocate(live.swap_remove(index));
        }

        let stats = arena.stats();
        assert_eq!(stats.free_bytes + stats.allocated_bytes, total);
    }
    arena.verify_invariants();

    live.shuffle(&mut rng);
    for allocation in live {
        arena.deallocate(allocation);
    }
    let stats = arena.stats();
    assert_eq!(stats.free_bytes, total);
    assert_eq!(stats.free_tag_count, 2);
    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn allocation_round_trip_preserves_length() {
    let env = env();
    let arena = plain_arena(&env, "round-trip", 0x10);
    arena.add_span(0, 0x2000).unwrap();

    let first = arena.allocate(0x120, AllocationPolicy::InstantFit).unwrap();
    let len = first.len;
    arena.deallocate(first);
    let second = arena.allocate(len, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(second.len, len);

    arena.deallocate(second);
    let stats = arena.stats();
    assert_eq!(stats.free_bytes, 0x2000);
    assert_eq!(stats.allocation_count, 0);
    arena.deinit();
}

#[test]
fn best_fit_prefers_the_tightest_tag() {
    let env = env();
    let arena = plain_arena(&env, "best-fit", 0x10);
    // Three disjoint spans produce three free tags of different sizes in
    // the same power-of-two bucket.
    arena.add_span(0x1000, 0x700).unwrap();
    arena.add_span(0x3000, 0x500).unwrap();
    arena.add_span(0x5000, 0x600).unwrap();

    // 0x500, 0x600 and 0x700 all live in freelist index 10; best fit for
    // 0x480 must come from the 0x500 tag.
    let allocation = arena.allocate(0x480, AllocationPolicy::BestFit).unwrap();
    assert_eq!(allocation.base, 0x3000);

    // An exact match short-circuits: 0x600 rather than splitting 0x700.
    let exact = arena.allocate(0x600, AllocationPolicy::BestFit).unwrap();
    assert_eq!(exact.base, 0x5000);

    arena.deallocate(allocation);
    arena.deallocate(exact);
    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn instant_fit_skips_undersized_buckets() {
    let env = env();
    let arena = plain_arena(&env, "instant-fit", 0x10);
    arena.add_span(0x1000, 0x300).unwrap();
    arena.add_span(0x8000, 0x4000).unwrap();

    // 0x280 has its exact bucket occupied by the 0x300 tag, but instant fit
    // consults the guaranteed-fit mask first and takes the big tag.
    let allocation = arena.allocate(0x280, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(allocation.base, 0x8000);

    // Once only the 0x300 tag can serve it, the exact-bucket fallback
    // kicks in.
    let rest = arena.allocate(0x4000 - 0x280, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(rest.base, 0x8000 + 0x280);
    let fallback = arena.allocate(0x280, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(fallback.base, 0x1000);

    arena.deallocate(allocation);
    arena.deallocate(rest);
    arena.deallocate(fallback);
    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn first_fit_scans_the_exact_bucket_first() {
    let env = env();
    let arena = plain_arena(&env, "first-fit", 0x10);
    arena.add_span(0x1000, 0x700).unwrap();
    arena.add_span(0x8000, 0x2000).unwrap();

    // First fit takes a same-bucket tag even though a larger one exists.
    let allocation = arena.allocate(0x400, AllocationPolicy::FirstFit).unwrap();
    assert_eq!(allocation.base, 0x1000);

    arena.deallocate(allocation);
    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn hash_lookup_survives_randomized_free_order() {
    let env = env();
    let arena = plain_arena(&env, "hash-order", 0x10);
    arena.add_span(0, 1000 * 0x10).unwrap();

    let mut live: std::vec::Vec<Allocation> = (0..1000)
        .map(|_| arena.allocate(0x10, AllocationPolicy::InstantFit).unwrap())
        .collect();
    assert_eq!(arena.stats().allocation_count, 1000);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    live.shuffle(&mut rng);
    for allocation in live {
        arena.deallocate(allocation);
    }

    let stats = arena.stats();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.free_tag_count, 1);
    arena.verify_invariants();
    arena.deinit();
}

#[test]
#[should_panic(expected = "free of unknown allocation")]
fn deallocate_of_unknown_allocation_panics() {
    let env = env();
    let arena = plain_arena(&env, "unknown-free", 0x10);
    arena.add_span(0, 0x1000).unwrap();
    arena.deallocate(Allocation { base: 0x500, len: 0x10 });
}

#[test]
#[should_panic(expected = "live allocations")]
fn deinit_with_live_allocation_panics() {
    let env = env();
    let arena = plain_arena(&env, "leaky-deinit", 0x10);
    arena.add_span(0, 0x1000).unwrap();
    let _live = arena.allocate(0x10, AllocationPolicy::InstantFit).unwrap();
    arena.deinit();
}

/// A span source that counts imports and releases, forwarding to an arena.
struct CountingSource {
    backing: &'static Arena,
    imports: AtomicUsize,
    releases: AtomicUsize,
}

impl SpanSource for CountingSource {
    fn import(&self, len: usize, policy: AllocationPolicy) -> Result<Allocation, AllocateError> {
        self.imports.fetch_add(1, Ordering::Relaxed);
        self.backing.import(len, policy)
    }

    fn release(&self, allocation: Allocation) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.backing.release(allocation);
    }
}

#[test]
fn imported_spans_are_released_when_fully_freed() {
    let env = env();
    let parent = plain_arena(&env, "import-parent", 0x1000);
    parent.add_span(0x100_0000, 0x10_000).unwrap();

    let source: &'static CountingSource = Box::leak(Box::new(CountingSource {
        backing: parent,
        imports: AtomicUsize::new(0),
        releases: AtomicUsize::new(0),
    }));
    let child = env.leak_arena(
        "import-child",
        0x10,
        ArenaOptions { source: Some(source), quantum_caches: None },
    );

    // No span of its own: the first allocation imports one parent quantum.
    let a = child.allocate(0x30, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(source.imports.load(Ordering::Relaxed), 1);
    assert_eq!(child.stats().imported_span_count, 1);
    assert_eq!(parent.stats().allocated_bytes, 0x1000);

    // A second allocation fits in the imported span: no new import.
    let b = child.allocate(0x200, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(source.imports.load(Ordering::Relaxed), 1);

    // Freeing one allocation is not enough to release the span.
    child.deallocate(a);
    assert_eq!(source.releases.load(Ordering::Relaxed), 0);

    // Freeing the last one returns the exact span to the parent.
    child.deallocate(b);
    assert_eq!(source.releases.load(Ordering::Relaxed), 1);
    assert_eq!(child.stats().imported_span_count, 0);
    assert_eq!(parent.stats().allocated_bytes, 0);

    child.verify_invariants();
    parent.verify_invariants();
    child.deinit();
    parent.deinit();
}

#[test]
fn oversized_imports_span_multiple_quanta() {
    let env = env();
    let parent = plain_arena(&env, "multi-import-parent", 0x1000);
    parent.add_span(0x200_0000, 0x10_000).unwrap();
    let child = env.leak_arena(
        "multi-import-child",
        0x10,
        ArenaOptions { source: Some(parent), quantum_caches: None },
    );

    let big = child.allocate(0x2800, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(big.len, 0x2800);
    // The parent handed over whole pages.
    assert_eq!(parent.stats().allocated_bytes, 0x3000);

    child.deallocate(big);
    assert_eq!(parent.stats().allocated_bytes, 0);
    child.deinit();
    parent.deinit();
}

/// A source that always declines.
struct FailingSource;

impl SpanSource for FailingSource {
    fn import(&self, _len: usize, _policy: AllocationPolicy) -> Result<Allocation, AllocateError> {
        Err(AllocateError::RequestedLengthUnavailable)
    }

    fn release(&self, _allocation: Allocation) {
        unreachable!("nothing was ever imported");
    }
}

#[test]
fn import_exhaustion_surfaces_unavailable() {
    static FAILING: FailingSource = FailingSource;
    let env = env();
    let arena = env.leak_arena(
        "failing-import",
        0x10,
        ArenaOptions { source: Some(&FAILING), quantum_caches: None },
    );
    arena.add_span(0, 0x100).unwrap();

    // Within the span: fine.
    let small = arena.allocate(0x40, AllocationPolicy::InstantFit).unwrap();
    // Larger than anything the span or the source can provide.
    assert_eq!(
        arena.allocate(0x1000, AllocationPolicy::InstantFit),
        Err(AllocateError::RequestedLengthUnavailable)
    );

    arena.deallocate(small);
    arena.deinit();
}

#[test]
fn out_of_boundary_tags_when_frames_are_gone() {
    // Tiny pool: one frame goes to the first tag slab during environment
    // setup, the rest is drained here so the tag cache cannot grow.
    let env = TestEnv::new(2 * PAGE_SIZE, 16 * PAGE_SIZE);
    let mut held = std::vec::Vec::new();
    while let Ok(frame) = env.frames().allocate() {
        held.push(frame);
    }

    // Spans burn two tags each; once the surviving tag slab is empty the
    // next top-up needs a frame and fails.
    let arena = plain_arena(&env, "tagless", 0x10);
    let mut exhausted = false;
    for index in 0..200usize {
        match arena.add_span(index * 0x2000, 0x1000) {
            Ok(()) => {}
            Err(AddSpanError::OutOfBoundaryTags) => {
                exhausted = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(exhausted, "tag cache never ran out");

    for frame in held {
        env.frames().deallocate_one(frame);
    }
}

#[test]
fn quantum_caches_serve_small_requests() {
    let env = env();
    let arena = env.leak_arena(
        "qcache",
        0x10,
        ArenaOptions {
            source: None,
            quantum_caches: Some(QuantumCacheConfig {
                count: 4,
                storage: QuantumCacheStorage::Heap(env.frames()),
                slab_backing: env.pages(),
            }),
        },
    );
    arena.add_span(0x40_0000, 0x1000).unwrap();

    // Cached sizes bypass the arena's own tags entirely.
    let cached = arena.allocate(0x20, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(cached.len, 0x20);
    assert_eq!(arena.stats().allocation_count, 0);
    assert_eq!(arena.stats().free_bytes, 0x1000);

    // The memory is real and writable.
    unsafe {
        core::ptr::write_bytes(cached.base as *mut u8, 0xab, cached.len);
    }
    arena.deallocate(cached);

    // Reuse comes from the cache.
    let again = arena.allocate(0x20, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(again.base, cached.base);
    arena.deallocate(again);

    arena.verify_invariants();
    arena.deinit();
}

#[test]
fn quantum_caches_do_not_change_uncached_base_sequences() {
    let env = env();
    let plain = plain_arena(&env, "idempotence-plain", 0x10);
    let cached = env.leak_arena(
        "idempotence-cached",
        0x10,
        ArenaOptions {
            source: None,
            quantum_caches: Some(QuantumCacheConfig {
                count: 2,
                storage: QuantumCacheStorage::Heap(env.frames()),
                slab_backing: env.pages(),
            }),
        },
    );
    plain.add_span(0x9000, 0x4000).unwrap();
    cached.add_span(0x9000, 0x4000).unwrap();

    // Sizes above count * quantum take the ordinary tag path in both
    // arenas and must produce identical base sequences.
    let sizes = [0x30usize, 0x100, 0x30, 0x400, 0x50];
    let mut from_plain = std::vec::Vec::new();
    let mut from_cached = std::vec::Vec::new();
    for &size in &sizes {
        from_plain.push(plain.allocate(size, AllocationPolicy::InstantFit).unwrap());
        from_cached.push(cached.allocate(size, AllocationPolicy::InstantFit).unwrap());
    }
    let plain_bases: std::vec::Vec<usize> = from_plain.iter().map(|a| a.base).collect();
    let cached_bases: std::vec::Vec<usize> = from_cached.iter().map(|a| a.base).collect();
    assert_eq!(plain_bases, cached_bases);

    for (a, b) in from_plain.into_iter().zip(from_cached) {
        plain.deallocate(a);
        cached.deallocate(b);
    }
    plain.deinit();
    cached.deinit();
}

#[test]
fn stats_track_unused_tag_stash() {
    let env = env();
    let arena = plain_arena(&env, "stash", 0x10);
    arena.add_span(0, 0x1000).unwrap();
    // add_span pre-funds the stash; nothing was consumed beyond the two
    // span tags.
    let stats = arena.stats();
    assert_eq!(stats.span_count, 1);
    assert_eq!(stats.free_tag_count, 1);
    assert_eq!(stats.unused_tag_count, 0);
    arena.deinit();
}
