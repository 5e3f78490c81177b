//! Property-based checks for the quantified invariants and counter
//! identities of `SPEC_FULL.md` §8, plus the named concrete scenarios that
//! pin specific behaviors (S1, S2, S6, boundary cases).
//!
//! The popcount/free_count and list-id invariants (1, 2) are checked at the
//! crate-internal level in `src/class.rs`'s own `proptests` module, which
//! has access to slab header fields this integration test cannot see.
//! What's checked here is everything observable through the public API:
//! counter identities, handle round-tripping, and cache conservation.

use proptest::prelude::*;
use slabtemporal::{AllocError, SlabAllocator};
use std::collections::HashMap;

const SIZES: [usize; 4] = [64, 192, 512, 1536];

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(usize),
    Free(usize),
    Advance,
}

fn op_sequence() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0usize..SIZES.len()).prop_map(Op::Alloc),
            2 => (0usize..64).prop_map(Op::Free),
            1 => Just(Op::Advance),
        ],
        1..300,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invariant 7: slow_path_hits decomposes exactly into its four named
    /// reasons at every point in a randomized alloc/free/advance sequence.
    /// Invariant 9: every slab ever produced is accounted for by exactly
    /// one of {currently in a cache, recycled-and-reused, still counted as
    /// created-but-not-yet-recycled} — checked via the weaker public
    /// corollary that recycled count never exceeds created count.
    #[test]
    fn counter_identities_hold_throughout(ops in op_sequence()) {
        let alloc = SlabAllocator::new();
        let mut live: HashMap<slabtemporal::Handle, usize> = HashMap::new();
        let mut epoch = alloc.epoch_current();

        for op in ops {
            match op {
                Op::Alloc(size_idx) => {
                    let size = SIZES[size_idx];
                    if let Ok((ptr, handle)) = alloc.alloc_obj(size, epoch) {
                        unsafe { ptr.as_ptr().write_bytes(0xCC, size) };
                        live.insert(handle, size);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let key = *live.keys().nth(idx % live.len()).unwrap();
                        let size = live.remove(&key).unwrap();
                        let _ = size;
                        alloc.free_obj(key).unwrap();
                    }
                }
                Op::Advance => {
                    epoch = alloc.epoch_advance();
                }
            }

            let g = alloc.stats_global();
            prop_assert_eq!(
                g.total_slow_path_hits,
                g.slow_cache_miss + g.slow_epoch_closed + g.slow_current_partial_null + g.slow_current_partial_full,
                "slow_path_hits must decompose exactly into its four reasons"
            );
            prop_assert!(
                g.total_slabs_recycled <= g.total_slabs_allocated,
                "can never recycle more slabs than were ever created"
            );
        }

        for (h, _) in live {
            let _ = alloc.free_obj(h);
        }
    }
}

/// S1 (single-thread sawtooth): allocate a batch into one epoch, free it
/// all, close the epoch. Partial<->full transitions must balance and every
/// slab produced must end up back in the cache, advised exactly once.
#[test]
fn s1_single_thread_sawtooth() {
    let alloc = SlabAllocator::new();
    let epoch = alloc.epoch_current();

    let mut handles = Vec::new();
    for _ in 0..1024 {
        let (_, h) = alloc.alloc_obj(128, epoch).expect("alloc");
        handles.push(h);
    }
    for h in handles {
        alloc.free_obj(h).expect("free");
    }
    alloc.epoch_close(epoch);

    let global = alloc.stats_global();
    assert_eq!(
        global.total_slabs_allocated, global.total_slabs_recycled,
        "every slab created by the sawtooth must be recycled once everything is freed and the epoch closed"
    );
    assert_eq!(
        global.madvise_calls, global.total_slabs_allocated,
        "one advise per slab ever pushed to a cache"
    );
}

/// S2 (leak detection): most handles are freed promptly but 1% are
/// retained across an epoch close; that epoch's stats must keep reporting
/// nonzero occupancy and positive estimated bytes until the retained
/// handles are freed.
#[test]
fn s2_leak_detection_keeps_epoch_occupied_until_drained() {
    let alloc = SlabAllocator::new();
    let mut retained = Vec::new();
    let mut epoch = alloc.epoch_current();
    let retired_epoch = epoch;

    for round in 0..2000 {
        let (_, h) = alloc.alloc_obj(128, epoch).expect("alloc");
        if round % 100 == 99 {
            retained.push(h);
        } else {
            alloc.free_obj(h).expect("free");
        }
        if round % 100 == 0 && round > 0 {
            epoch = alloc.epoch_advance();
        }
    }

    alloc.epoch_close(retired_epoch);
    let snap = alloc.stats_epoch(1, retired_epoch).expect("class 1 tracks 128-byte objects");
    assert!(snap.lifecycle_closing);
    assert!(snap.estimated_bytes > 0, "retained handles must keep the epoch's footprint nonzero");

    for h in retained {
        alloc.free_obj(h).expect("free retained handle");
    }
}

/// S6 (closed-epoch reject), restated at the property-test boundary: once
/// closed, an epoch rejects new allocations but other epochs are
/// unaffected, and the rejection is exactly one `slow_epoch_closed` tick.
#[test]
fn s6_closed_epoch_rejects_without_disturbing_others() {
    let alloc = SlabAllocator::new();
    let e0 = alloc.epoch_current();
    alloc.epoch_close(e0);

    let before = alloc.stats_global().slow_epoch_closed;
    assert_eq!(alloc.alloc_obj(64, e0), Err(AllocError::EpochClosed));
    assert_eq!(alloc.stats_global().slow_epoch_closed, before + 1);

    let e1 = alloc.epoch_advance();
    let (_, h) = alloc.alloc_obj(64, e1).expect("other epoch unaffected");
    alloc.free_obj(h).expect("free");
}

/// Boundary behaviors from §8: size 0 maps to the smallest class, max
/// class succeeds, one byte over max class fails explicitly.
#[test]
fn boundary_sizes_at_the_edges_of_the_class_table() {
    let alloc = SlabAllocator::new();
    let epoch = alloc.epoch_current();

    let (_, h_zero) = alloc.alloc_obj(0, epoch).expect("size 0 maps to the smallest class");
    alloc.free_obj(h_zero).expect("free");

    let class = alloc.stats_classes().last().cloned().expect("at least one class configured");
    let max_size = class.object_size;
    let (_, h_max) = alloc.alloc_obj(max_size, epoch).expect("exactly the largest class succeeds");
    alloc.free_obj(h_max).expect("free");

    assert_eq!(alloc.alloc_obj(max_size + 1, epoch), Err(AllocError::SizeTooLarge));
}
