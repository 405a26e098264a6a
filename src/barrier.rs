//! Post-write-barrier facade.
//!
//! Owns the card table view, the buffer allocators, both queue sets, and
//! the thread registry, and provides the entry points the runtime calls:
//! the logging barrier itself, the classic slow-path dirtying used when
//! written-card queues are disabled, and the thread lifecycle hooks.

use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::Arc;

use crate::buffer::BufferAllocator;
use crate::card_table::{load_card, store_card, CardTable, DIRTY_CARD, YOUNG_CARD};
use crate::dirty::DirtyCardQueueSet;
use crate::error::CardGripResult;
use crate::flags::{CollectorFlags, FilterMode};
use crate::thread::{GcThreadLocal, MutatorThread, ThreadKind, ThreadRegistry};
use crate::written::WrittenCardQueueSet;

/// Allocation tags, for catching a node released to the wrong pool.
const WRITTEN_BUFFER_TAG: u32 = 1;
const DIRTY_BUFFER_TAG: u32 = 2;

pub struct PostBarrier {
    flags: CollectorFlags,
    card_table: Arc<CardTable>,
    wcqs: Arc<WrittenCardQueueSet>,
    dcqs: Arc<DirtyCardQueueSet>,
    registry: Arc<ThreadRegistry>,
}

impl PostBarrier {
    pub fn new(flags: CollectorFlags, card_table: Arc<CardTable>) -> CardGripResult<Arc<Self>> {
        flags.validate()?;
        let written_allocator = Arc::new(BufferAllocator::new(
            "wc buffer allocator",
            flags.written_card_buffer_size,
            WRITTEN_BUFFER_TAG,
        ));
        let dirty_allocator = Arc::new(BufferAllocator::new(
            "dc buffer allocator",
            flags.update_buffer_size,
            DIRTY_BUFFER_TAG,
        ));
        let dcqs = Arc::new(DirtyCardQueueSet::new(dirty_allocator));
        let wcqs = Arc::new(WrittenCardQueueSet::new(
            &flags,
            written_allocator,
            Arc::clone(&card_table),
            Arc::clone(&dcqs),
        ));
        Ok(Arc::new(PostBarrier {
            flags,
            card_table,
            wcqs,
            dcqs,
            registry: Arc::new(ThreadRegistry::new()),
        }))
    }

    pub fn flags(&self) -> &CollectorFlags {
        &self.flags
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    pub fn written_card_queue_set(&self) -> &Arc<WrittenCardQueueSet> {
        &self.wcqs
    }

    pub fn dirty_card_queue_set(&self) -> &Arc<DirtyCardQueueSet> {
        &self.dcqs
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    /// Create a thread's GC-local data and register it.
    pub fn on_thread_create(&self, kind: ThreadKind) -> MutatorThread {
        let thread = MutatorThread::new(
            self.registry.next_thread_id(),
            kind,
            self.flags.queue_mode(),
        );
        self.registry.register(&thread);
        thread
    }

    /// A thread begins running application code.  Its logs must be empty.
    pub fn on_thread_attach(&self, thread: &MutatorThread) {
        thread.with_gc_data(|gc| {
            if self.flags.use_written_card_queues {
                assert!(
                    gc.wcq.is_empty(self.wcqs.mode()),
                    "written card queue not empty at attach"
                );
            }
            assert!(gc.dcq.is_empty(), "dirty card queue not empty at attach");
        });
    }

    /// A thread stops running application code.  Drain its logs into the
    /// global sets and fold its stats into the detached total.
    pub fn on_thread_detach(&self, thread: &MutatorThread) {
        thread.with_gc_data(|gc| {
            if self.flags.use_written_card_queues {
                let GcThreadLocal { wcq, dcq, stats, .. } = gc;
                wcq.mark_cards_dirty(&self.wcqs, dcq, stats);
                wcq.discard_buffer(&self.wcqs);
            }
            self.dcqs.flush_queue(&mut gc.dcq, &mut gc.stats);
            self.dcqs.record_detached_refinement_stats(&gc.stats);
            gc.stats.reset();
        });
        let _ = self.registry.unregister(thread);
    }

    /// The post barrier for a reference store to `addr`.
    #[inline]
    pub fn write_ref_field_post(&self, thread: &MutatorThread, addr: usize) {
        if !self.flags.use_written_card_queues {
            let entry = self.card_table.byte_for(addr);
            let value = unsafe { load_card(entry) };
            if value != YOUNG_CARD && value != DIRTY_CARD {
                self.write_ref_field_post_slow(thread, entry);
            }
            return;
        }
        thread.with_gc_data(|gc| self.log_written_card(gc, addr));
    }

    /// Dirty a not-young card and enqueue it, used when written-card
    /// queues are disabled.  The fence orders the application store
    /// against the card reread.
    pub fn write_ref_field_post_slow(&self, thread: &MutatorThread, entry: *const AtomicU8) {
        debug_assert!(
            unsafe { load_card(entry) } != YOUNG_CARD,
            "slow path invoked without filtering"
        );
        fence(Ordering::SeqCst);
        if unsafe { load_card(entry) } != DIRTY_CARD {
            unsafe { store_card(entry, DIRTY_CARD) };
            thread.with_gc_data(|gc| {
                self.dcqs.enqueue(&mut gc.dcq, entry, &mut gc.stats);
            });
        }
    }

    fn log_written_card(&self, gc: &mut GcThreadLocal, addr: usize) {
        let mode = self.wcqs.mode();
        let value = match mode.filter {
            FilterMode::None => addr,
            FilterMode::Young => {
                let entry = self.card_table.byte_for(addr);
                if unsafe { load_card(entry) } == YOUNG_CARD {
                    return;
                }
                entry as usize
            }
            FilterMode::Previous => {
                let card = self.card_table.index_for(addr);
                if gc.wcq.previous_entry(mode) == card {
                    return;
                }
                card
            }
        };
        if !gc.wcq.try_append(value, mode) {
            self.wcqs.handle_full_buffer(gc);
            let appended = gc.wcq.try_append(value, mode);
            debug_assert!(appended, "overflow handler left no room");
        }
    }

    /// Flush any allocation-path deferred card marks for `thread`.
    /// Deferred marks belong to the heap's allocation layer; this crate
    /// keeps the hook so the retirement task can honor the ordering
    /// contract (marks flushed before logs are concatenated).
    pub fn make_parsable(&self, _thread: &MutatorThread) {}

    /// Safepoint-only: throw away all logged state.  Every thread's
    /// queues end up empty, both completed lists end up empty, and every
    /// thread's stats are reset.
    pub fn abandon_post_barrier_logs_and_stats(&self) {
        for thread in self.registry.snapshot() {
            thread.with_gc_data(|gc| {
                if self.flags.use_written_card_queues {
                    gc.wcq.reset(self.wcqs.mode());
                }
                self.dcqs.reset_queue(&mut gc.dcq);
                gc.stats.reset();
            });
        }
        if self.flags.use_written_card_queues {
            self.wcqs.abandon_completed_buffers();
        }
        self.dcqs.abandon_completed_buffers_and_stats();
        log::debug!("post-barrier logs and stats abandoned");
    }
}
