//! Property-based tests for the card-tracking invariants.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use cardgrip::buffer::{BufferAllocator, BufferNode};
use cardgrip::card_table::{CardTable, CLEAN_CARD, DEFAULT_CARD_SHIFT, DIRTY_CARD};
use cardgrip::dirty::{DirtyCardQueue, DirtyCardQueueSet};
use cardgrip::flags::{CollectorFlags, FilterMode};
use cardgrip::stats::RefinementStats;
use cardgrip::thread::ThreadKind;
use cardgrip::PostBarrier;

fn arb_stats() -> impl Strategy<Value = RefinementStats> {
    (
        0u64..1_000_000,
        0usize..1_000_000,
        0usize..1_000_000,
        0usize..1_000_000,
        0usize..1_000_000,
    )
        .prop_map(|(time_us, refined, dirtied, filtered, written)| {
            let mut s = RefinementStats::new();
            s.inc_refinement_time(Duration::from_micros(time_us));
            s.inc_refined_cards(refined);
            s.inc_written_cards_dirtied(dirtied);
            s.inc_written_cards_filtered(filtered);
            s.inc_written_cards(written);
            s
        })
}

proptest! {
    /// (s += t) -= t leaves s unchanged.
    #[test]
    fn stats_accumulate_then_remove_is_identity(s in arb_stats(), t in arb_stats()) {
        let mut acc = s;
        acc += t;
        acc -= t;
        prop_assert_eq!(acc, s);
    }

    /// Append up to capacity then reset: the queue is indistinguishable
    /// from a fresh one.
    #[test]
    fn queue_reset_round_trips(
        values in proptest::collection::vec(0usize..usize::MAX / 2, 0..36),
        filter in prop_oneof![Just(FilterMode::None), Just(FilterMode::Young), Just(FilterMode::Previous)],
    ) {
        let flags = CollectorFlags {
            use_inline_written_card_buffers: true,
            written_card_filter: filter,
            ..CollectorFlags::default()
        };
        let ct = Arc::new(CardTable::new(0, 1 << 20, DEFAULT_CARD_SHIFT));
        let barrier = PostBarrier::new(flags, ct).unwrap();
        let mode = barrier.written_card_queue_set().mode();
        let thread = barrier.on_thread_create(ThreadKind::Mutator);

        thread.with_gc_data(|gc| {
            let capacity = gc.wcq.current_capacity(mode);
            for v in values.iter().take(capacity) {
                assert!(gc.wcq.try_append(*v, mode));
            }
            gc.wcq.reset(mode);
            assert!(gc.wcq.is_empty(mode));
            assert_eq!(gc.wcq.index(), capacity);
            assert_eq!(gc.wcq.size(mode), 0);
        });
    }

    /// The completed-list card count matches the pushed sizes exactly
    /// between operations, and pop returns what push added.
    #[test]
    fn num_cards_is_exact_between_operations(sizes in proptest::collection::vec(1usize..64, 1..16)) {
        let allocator = Arc::new(BufferAllocator::new("prop", 64, 3));
        let dcqs = DirtyCardQueueSet::new(Arc::clone(&allocator));
        let mut total = 0;
        let mut nodes = Vec::new();
        for size in &sizes {
            let node = allocator.allocate();
            unsafe { (*node).set_index(64 - size) };
            total += size;
            dcqs.enqueue_completed_buffer(node);
            nodes.push(node);
            prop_assert_eq!(dcqs.num_cards(), total);
        }
        let mut seen = 0;
        loop {
            let node = dcqs.take_completed_buffer();
            if node.is_null() {
                break;
            }
            seen += unsafe { (*node).size() };
            prop_assert!(nodes.contains(&node));
            allocator.release(node);
        }
        prop_assert_eq!(seen, total);
        prop_assert_eq!(dcqs.num_cards(), 0);
    }

    /// Every card handed to the dirty queue was clean immediately before
    /// being stored dirty; pre-dirtied cards are filtered.
    #[test]
    fn only_clean_cards_transition(pre_dirty in proptest::collection::btree_set(0usize..200, 0..50)) {
        let flags = CollectorFlags {
            use_inline_written_card_buffers: true,
            ..CollectorFlags::default()
        };
        let ct = Arc::new(CardTable::new(0, 256 << DEFAULT_CARD_SHIFT, DEFAULT_CARD_SHIFT));
        for &card in &pre_dirty {
            ct.set_card_value(card << DEFAULT_CARD_SHIFT, DIRTY_CARD);
        }
        let barrier = PostBarrier::new(flags, Arc::clone(&ct)).unwrap();
        let thread = barrier.on_thread_create(ThreadKind::Mutator);
        let wcqs = barrier.written_card_queue_set();

        for card in 0..30 {
            barrier.write_ref_field_post(&thread, card << DEFAULT_CARD_SHIFT);
        }
        let (dirtied, filtered) = thread.with_gc_data(|gc| {
            let mut stats = RefinementStats::new();
            let cardgrip::thread::GcThreadLocal { wcq, dcq, .. } = gc;
            wcq.mark_cards_dirty(wcqs, dcq, &mut stats);
            (stats.written_cards_dirtied(), stats.written_cards_filtered())
        });

        let pre_dirty_in_range = pre_dirty.iter().filter(|&&c| c < 30).count();
        prop_assert_eq!(dirtied, 30 - pre_dirty_in_range);
        prop_assert_eq!(filtered, pre_dirty_in_range);
        for card in 0..30usize {
            prop_assert_eq!(ct.card_value(card << DEFAULT_CARD_SHIFT), DIRTY_CARD);
        }
        prop_assert_eq!(ct.card_value(40 << DEFAULT_CARD_SHIFT),
                        if pre_dirty.contains(&40) { DIRTY_CARD } else { CLEAN_CARD });
        barrier.on_thread_detach(&thread);
    }

    /// Checked narrowing round-trips whenever the check passes.
    #[test]
    fn checked_cast_round_trips(v in any::<u64>()) {
        match u32::try_from(v) {
            Ok(narrow) => prop_assert_eq!(u64::from(narrow), v),
            Err(_) => prop_assert!(v > u64::from(u32::MAX)),
        }
    }
}

/// Pushing from several threads while a reader samples the count: the
/// sample never exceeds what was pushed in total, and the final count is
/// exact.
#[test]
fn concurrent_pushes_never_undercount() {
    let allocator = Arc::new(BufferAllocator::new("conc", 32, 3));
    let dcqs = Arc::new(DirtyCardQueueSet::new(Arc::clone(&allocator)));
    let pushers = 4;
    let per_thread = 50;

    crossbeam::scope(|s| {
        for _ in 0..pushers {
            let dcqs = Arc::clone(&dcqs);
            let allocator = Arc::clone(&allocator);
            s.spawn(move |_| {
                for _ in 0..per_thread {
                    let node = allocator.allocate();
                    unsafe { (*node).set_index(0) };
                    dcqs.enqueue_completed_buffer(node);
                }
            });
        }
        let dcqs = Arc::clone(&dcqs);
        s.spawn(move |_| {
            for _ in 0..1000 {
                assert!(dcqs.num_cards() <= pushers * per_thread * 32);
            }
        });
    })
    .unwrap();

    assert_eq!(dcqs.num_cards(), pushers * per_thread * 32);
    let mut drained = 0;
    loop {
        let node = dcqs.take_completed_buffer();
        if node.is_null() {
            break;
        }
        drained += 1;
        allocator.release(node);
    }
    assert_eq!(drained, pushers * per_thread);
}

/// A buffer handed back by pop is the same allocation push received.
#[test]
fn push_pop_returns_the_same_node() {
    let allocator = BufferAllocator::new("same", 8, 3);
    let dcqs = DirtyCardQueueSet::new(Arc::new(BufferAllocator::new("set", 8, 3)));
    let node = allocator.allocate();
    unsafe { (*node).set_index(4) };
    dcqs.enqueue_completed_buffer(node);
    let before = dcqs.num_cards();
    assert_eq!(before, 4);
    let popped = dcqs.take_completed_buffer();
    assert_eq!(popped, node);
    unsafe { BufferNode::deallocate(node) };
}

/// Bulk dirtying falls back to the generic enqueue exactly at the buffer
/// boundary and keeps going.
#[test]
fn bulk_enqueue_survives_full_buffers() {
    let flags = CollectorFlags {
        use_inline_written_card_buffers: true,
        update_buffer_size: 8,
        ..CollectorFlags::default()
    };
    let ct = Arc::new(CardTable::new(0, 1 << 20, DEFAULT_CARD_SHIFT));
    let barrier = PostBarrier::new(flags, ct).unwrap();
    let thread = barrier.on_thread_create(ThreadKind::Mutator);
    let wcqs = barrier.written_card_queue_set();
    let dcqs = barrier.dirty_card_queue_set();

    // 30 distinct clean cards through a 8-entry dirty buffer.
    for card in 0..30usize {
        barrier.write_ref_field_post(&thread, card << DEFAULT_CARD_SHIFT);
    }
    let mut dcq = DirtyCardQueue::new();
    let flushed = thread.with_gc_data(|gc| {
        let mut stats = RefinementStats::new();
        let flushed = gc.wcq.mark_cards_dirty(wcqs, &mut dcq, &mut stats);
        assert_eq!(stats.written_cards_dirtied(), 30);
        flushed
    });
    assert!(flushed);
    // Full buffers were published mid-batch; the rest is in the queue.
    assert_eq!(dcqs.num_cards() + dcq.size(), 30);
    let mut stats = RefinementStats::new();
    dcqs.flush_queue(&mut dcq, &mut stats);
    assert_eq!(dcqs.num_cards(), 30);
}
