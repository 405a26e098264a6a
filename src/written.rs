//! Per-thread written-card queues and their global set.
//!
//! The write barrier appends one word per tracked store.  What that word
//! is depends on the configured [`FilterMode`]:
//!
//! * `None` — the written address, after barrier precision.
//! * `Young` — the card-table entry pointer; the barrier already skipped
//!   young cards.
//! * `Previous` — the card index; the barrier already dropped sequential
//!   writes to the same card.
//!
//! The queue layout depends on the inline-buffers flag: either the
//! entries live in a small array inside the queue structure, or the queue
//! points at a heap buffer, with a two-slot spillover used before the
//! first real buffer is allocated.  Overflow handling comes in the
//! cross-product of the three storage strategies and the three filters;
//! the nine concrete entry points at the bottom of this file are the
//! slow-path targets a barrier emitter would call.

use std::mem::{offset_of, size_of};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch as epoch;
use crossbeam_utils::CachePadded;

use crate::buffer::{drain_chain, BufferAllocator, BufferNode, BufferStack};
use crate::card_table::{load_card, store_card, CardTable, CLEAN_CARD, DIRTY_CARD};
use crate::dirty::{DirtyCardQueue, DirtyCardQueueSet};
use crate::flags::{CollectorFlags, FilterMode, QueueMode};
use crate::stats::RefinementStats;
use crate::thread::GcThreadLocal;

/// Sentinel card index that matches no real card.  In `Previous` mode it
/// occupies the trailing slot so the barrier's duplicate check has
/// something to compare against when the queue is empty.
pub const NO_MATCHING_CARD: usize = usize::MAX;

/// Entry count of the in-struct array used with inline buffers.
pub const INLINE_CAPACITY: usize = 36;

/// Entry count of the spillover array used by the indirect layout before
/// the first heap buffer is allocated.
pub const INITIAL_CAPACITY: usize = 2;

const ELEMENT_SIZE: usize = size_of::<usize>();

#[repr(C)]
#[derive(Clone, Copy)]
struct IndirectStorage {
    /// Element pointer of the current heap buffer, or null while the
    /// queue is still using `initial`.
    buffer: *mut usize,
    initial: [usize; INITIAL_CAPACITY],
}

#[repr(C)]
union Storage {
    inline: [usize; INLINE_CAPACITY],
    indirect: IndirectStorage,
}

/// Thread-local log of written cards.
///
/// `index_in_bytes` is the fill cursor: it starts at the capacity in
/// bytes (empty) and moves toward zero.  Its offset, and the offsets of
/// the two buffer representations, are exposed for barrier emitters; see
/// [`WrittenCardQueue::byte_offset_of_index`].
#[repr(C)]
pub struct WrittenCardQueue {
    index_in_bytes: usize,
    storage: Storage,
}

// Safety: the heap buffer behind the indirect pointer is owned by this
// queue alone until it is handed off to the completed list.
unsafe impl Send for WrittenCardQueue {}

impl WrittenCardQueue {
    pub fn new(mode: QueueMode) -> Self {
        let mut wcq = WrittenCardQueue {
            index_in_bytes: 0,
            storage: Storage {
                inline: [0; INLINE_CAPACITY],
            },
        };
        if !mode.inline_buffers {
            wcq.storage.indirect = IndirectStorage {
                buffer: std::ptr::null_mut(),
                initial: [0; INITIAL_CAPACITY],
            };
        }
        wcq.reset(mode);
        wcq
    }

    /// Byte offset of the fill cursor, for barrier emitters.
    pub const fn byte_offset_of_index() -> usize {
        offset_of!(WrittenCardQueue, index_in_bytes)
    }

    /// Byte offset of the inline element array.
    pub const fn byte_offset_of_inline_buffer() -> usize {
        offset_of!(WrittenCardQueue, storage)
    }

    /// Byte offset of the indirect buffer pointer.  An emitted barrier
    /// loads the element pointer from here; a null value means the
    /// spillover array immediately after it is in use.
    pub const fn byte_offset_of_indirect_buffer() -> usize {
        offset_of!(WrittenCardQueue, storage)
    }

    /// Whether the indirect layout is still on its spillover array.
    fn is_initial(&self, mode: QueueMode) -> bool {
        debug_assert!(!mode.inline_buffers);
        unsafe { self.storage.indirect.buffer.is_null() }
    }

    /// Element pointer of the current backing store.
    pub fn buffer(&mut self, mode: QueueMode) -> *mut usize {
        if mode.inline_buffers {
            unsafe { self.storage.inline.as_mut_ptr() }
        } else {
            let indirect = unsafe { &mut self.storage.indirect };
            if indirect.buffer.is_null() {
                indirect.initial.as_mut_ptr()
            } else {
                indirect.buffer
            }
        }
    }

    /// Capacity of the backing store, in elements, before the filter
    /// adjustment.
    fn raw_capacity(&self, mode: QueueMode) -> usize {
        if mode.inline_buffers {
            INLINE_CAPACITY
        } else {
            let buffer = unsafe { self.storage.indirect.buffer };
            if buffer.is_null() {
                INITIAL_CAPACITY
            } else {
                unsafe { (*BufferNode::from_buffer(buffer)).capacity() }
            }
        }
    }

    /// Usable capacity: the `Previous` filter reserves the trailing slot
    /// for its sentinel.
    pub fn current_capacity(&self, mode: QueueMode) -> usize {
        let mut capacity = self.raw_capacity(mode);
        if mode.filter == FilterMode::Previous {
            capacity -= 1;
        }
        capacity
    }

    pub fn index(&self) -> usize {
        debug_assert_eq!(self.index_in_bytes % ELEMENT_SIZE, 0);
        self.index_in_bytes / ELEMENT_SIZE
    }

    pub fn set_index(&mut self, new_index: usize, mode: QueueMode) {
        debug_assert!(new_index <= self.current_capacity(mode), "index past capacity");
        self.index_in_bytes = new_index * ELEMENT_SIZE;
    }

    pub fn size(&self, mode: QueueMode) -> usize {
        self.current_capacity(mode) - self.index()
    }

    pub fn is_empty(&self, mode: QueueMode) -> bool {
        self.index() == self.current_capacity(mode)
    }

    /// Empty the queue, reinstating the `Previous` sentinel.
    pub fn reset(&mut self, mode: QueueMode) {
        let capacity = self.current_capacity(mode);
        self.set_index(capacity, mode);
        if mode.filter == FilterMode::Previous {
            unsafe { *self.buffer(mode).add(capacity) = NO_MATCHING_CARD };
        }
    }

    /// The most recently appended entry, or the sentinel when empty.
    /// Only meaningful in `Previous` mode, where the barrier compares the
    /// candidate card index against it.
    pub fn previous_entry(&mut self, mode: QueueMode) -> usize {
        debug_assert_eq!(mode.filter, FilterMode::Previous);
        let index = self.index();
        unsafe { *self.buffer(mode).add(index) }
    }

    /// Append one entry.  Returns false when the queue is full; the
    /// caller must run the overflow handler for its configuration and
    /// retry.
    #[inline]
    pub fn try_append(&mut self, value: usize, mode: QueueMode) -> bool {
        if self.index_in_bytes == 0 {
            return false;
        }
        self.index_in_bytes -= ELEMENT_SIZE;
        let index = self.index_in_bytes / ELEMENT_SIZE;
        unsafe { *self.buffer(mode).add(index) = value };
        true
    }

    /// Transform the unprocessed entries according to the filter and
    /// dirty their clean cards, appending each freshly dirtied card to
    /// `dcq`.  Returns true if the dcq was flushed because of a full
    /// buffer.
    pub fn mark_cards_dirty(
        &mut self,
        wcqs: &WrittenCardQueueSet,
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        let mode = wcqs.mode();
        let raw_capacity = self.raw_capacity(mode);
        let idx = self.index();
        if raw_capacity > idx {
            let mut len = raw_capacity - idx;
            match mode.filter {
                FilterMode::None | FilterMode::Young => self.set_index(raw_capacity, mode),
                FilterMode::Previous => {
                    // The trailing sentinel is not an entry.
                    self.set_index(raw_capacity - 1, mode);
                    len -= 1;
                    if len == 0 {
                        return false;
                    }
                }
            }
            // Taken after the cursor update: no further exclusive borrow
            // of the queue may intervene before the slice is consumed.
            let base = self.buffer(mode);
            // Safety: [idx, idx + len) lies inside the backing store.
            let written = unsafe { std::slice::from_raw_parts_mut(base.add(idx), len) };
            match mode.filter {
                FilterMode::None => wcqs.mark_cards_dirty_none_filtered(written, dcq, stats),
                FilterMode::Young => wcqs.mark_cards_dirty_young_filtered(written, dcq, stats),
                FilterMode::Previous => {
                    wcqs.mark_cards_dirty_previous_filtered(written, dcq, stats)
                }
            }
        } else {
            debug_assert!(
                raw_capacity == idx && mode.filter != FilterMode::Previous,
                "cursor past the backing store"
            );
            false
        }
    }

    /// Hand a promoted indirect buffer back to the pool and return to the
    /// spillover array.  Called at thread detach, after the queue has
    /// been drained.
    pub fn discard_buffer(&mut self, wcqs: &WrittenCardQueueSet) {
        let mode = wcqs.mode();
        debug_assert!(self.is_empty(mode), "discarding a non-empty queue");
        if !mode.inline_buffers && !self.is_initial(mode) {
            let node = unsafe { BufferNode::from_buffer(self.storage.indirect.buffer) };
            unsafe { self.storage.indirect.buffer = std::ptr::null_mut() };
            wcqs.allocator().release(node);
            self.reset(mode);
        }
    }
}

type Marker =
    fn(&WrittenCardQueueSet, &mut [usize], &mut DirtyCardQueue, &mut RefinementStats) -> bool;

/// Process-wide state shared by every written-card queue.
pub struct WrittenCardQueueSet {
    mode: QueueMode,
    use_queues: bool,
    defer_dirtying: bool,
    allocator: Arc<BufferAllocator>,
    /// When false, filled queues are handed to the completed list without
    /// immediate dirtying.  Rarely written; flipped at safepoints.
    mutator_should_mark_cards_dirty: AtomicBool,
    num_cards: CachePadded<AtomicUsize>,
    buffer_list: CachePadded<BufferStack>,
    card_table: Arc<CardTable>,
    dcqs: Arc<DirtyCardQueueSet>,
}

impl WrittenCardQueueSet {
    pub fn new(
        flags: &CollectorFlags,
        allocator: Arc<BufferAllocator>,
        card_table: Arc<CardTable>,
        dcqs: Arc<DirtyCardQueueSet>,
    ) -> Self {
        WrittenCardQueueSet {
            mode: flags.queue_mode(),
            use_queues: flags.use_written_card_queues,
            defer_dirtying: flags.defer_dirtying_written_cards,
            allocator,
            mutator_should_mark_cards_dirty: AtomicBool::new(false),
            num_cards: CachePadded::new(AtomicUsize::new(0)),
            buffer_list: CachePadded::new(BufferStack::new()),
            card_table,
            dcqs,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn filter(&self) -> FilterMode {
        self.mode.filter
    }

    pub fn defer_dirtying(&self) -> bool {
        self.defer_dirtying
    }

    pub fn allocator(&self) -> &Arc<BufferAllocator> {
        &self.allocator
    }

    pub fn card_table(&self) -> &Arc<CardTable> {
        &self.card_table
    }

    pub fn dirty_card_queue_set(&self) -> &Arc<DirtyCardQueueSet> {
        &self.dcqs
    }

    /// Published count of cards held in completed buffers.  Never an
    /// undercount; exact between operations.
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::Acquire)
    }

    pub fn mutator_should_mark_cards_dirty(&self) -> bool {
        self.mutator_should_mark_cards_dirty.load(Ordering::Acquire)
    }

    pub fn set_mutator_should_mark_cards_dirty(&self, value: bool) {
        self.mutator_should_mark_cards_dirty.store(value, Ordering::Release);
    }

    /// Publish a filled buffer.  The count is bumped before the node is
    /// linked so observers always see at least the actual total.
    pub fn enqueue_completed_buffer(&self, node: *mut BufferNode) {
        debug_assert!(self.defer_dirtying, "completed written buffers require deferred dirtying");
        debug_assert!(!node.is_null());
        let size = unsafe { (*node).size() };
        self.num_cards.fetch_add(size, Ordering::AcqRel);
        self.buffer_list.push(node);
    }

    /// Pop one completed buffer, or null when the list is empty.
    pub fn take_completed_buffer(&self) -> *mut BufferNode {
        let node = {
            let guard = epoch::pin();
            self.buffer_list.pop(&guard)
        };
        if !node.is_null() {
            let size = unsafe { (*node).size() };
            self.num_cards.fetch_sub(size, Ordering::AcqRel);
        }
        node
    }

    /// Safepoint-only: detach and recycle every completed buffer.
    pub fn abandon_completed_buffers(&self) {
        drain_chain(self.buffer_list.pop_all(), |node| {
            self.allocator.release(node);
        });
        self.num_cards.store(0, Ordering::Release);
    }

    /// Take one completed buffer and mark its cards dirty.  Returns true
    /// if a buffer was processed.
    pub fn mark_cards_dirty(&self, dcq: &mut DirtyCardQueue, stats: &mut RefinementStats) -> bool {
        let node = self.take_completed_buffer();
        if node.is_null() {
            return false;
        }
        unsafe {
            debug_assert!(!(*node).is_empty(), "empty completed written buffer");
            let buf = BufferNode::buffer_of(node).add((*node).index());
            let size = (*node).size();
            match self.mode.filter {
                FilterMode::None => {
                    let written = std::slice::from_raw_parts_mut(buf, size);
                    self.mark_cards_dirty_none_filtered(written, dcq, stats);
                }
                FilterMode::Young => {
                    let written = std::slice::from_raw_parts_mut(buf, size);
                    self.mark_cards_dirty_young_filtered(written, dcq, stats);
                }
                FilterMode::Previous => {
                    let written = std::slice::from_raw_parts_mut(buf, size - 1);
                    self.mark_cards_dirty_previous_filtered(written, dcq, stats);
                }
            }
        }
        self.allocator.release(node);
        true
    }

    // The mark_cards_dirty_*_filtered transforms rewrite the written
    // buffer into card-table entry pointers, then feed it to
    // enqueue_clean_cards.  No time tracking here: clock reads are
    // expensive relative to the per-entry work.

    /// `written` holds raw written addresses.
    pub(crate) fn mark_cards_dirty_none_filtered(
        &self,
        written: &mut [usize],
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        debug_assert_eq!(self.mode.filter, FilterMode::None);
        let ct_base = self.card_table.byte_map_base();
        let shift = self.card_table.card_shift();
        let mut previous = NO_MATCHING_CARD;
        let mut kept = 0;
        for i in 0..written.len() {
            // Written address -> card index.
            let card = written[i] >> shift;
            // Drop sequential runs of the same card.
            if previous == card {
                continue;
            }
            previous = card;
            // Card index -> entry pointer, stored back in place for the
            // dirtying pass below.
            written[kept] = ct_base.wrapping_add(card) as usize;
            kept += 1;
        }
        stats.inc_written_cards_filtered(written.len() - kept);
        self.enqueue_clean_cards_helper(&written[..kept], dcq, stats)
    }

    /// `written` already holds card-table entry pointers.
    pub(crate) fn mark_cards_dirty_young_filtered(
        &self,
        written: &mut [usize],
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        debug_assert_eq!(self.mode.filter, FilterMode::Young);
        self.enqueue_clean_cards_helper(written, dcq, stats)
    }

    /// `written` holds card indices; sequential duplicates were already
    /// dropped by the barrier.
    pub(crate) fn mark_cards_dirty_previous_filtered(
        &self,
        written: &mut [usize],
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        debug_assert_eq!(self.mode.filter, FilterMode::Previous);
        let ct_base = self.card_table.byte_map_base();
        for entry in written.iter_mut() {
            *entry = ct_base.wrapping_add(*entry) as usize;
        }
        self.enqueue_clean_cards_helper(written, dcq, stats)
    }

    fn enqueue_clean_cards_helper(
        &self,
        written: &[usize],
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        !written.is_empty() && self.enqueue_clean_cards(written, dcq, stats)
    }

    /// Dirty the clean cards among `written` (entry pointers) and append
    /// each to `dcq`.  Appends are bulk-mode: the cursor update is
    /// deferred to the end of the batch, falling back to the generic
    /// enqueue for the one card that hits a full buffer.  Returns true if
    /// the dcq was flushed because of a full buffer.
    pub(crate) fn enqueue_clean_cards(
        &self,
        written: &[usize],
        dcq: &mut DirtyCardQueue,
        stats: &mut RefinementStats,
    ) -> bool {
        let mut flushed = false;
        let mut dirtied = 0;
        let mut filtered = 0;
        let mut dirty_buffer = dcq.buffer();
        let mut dirty_index = dcq.index();
        for &entry in written {
            let p = entry as *const std::sync::atomic::AtomicU8;
            if unsafe { load_card(p) } != CLEAN_CARD {
                filtered += 1;
            } else {
                // Card is clean: dirty it and enqueue it for refinement.
                unsafe { store_card(p, DIRTY_CARD) };
                dirtied += 1;
                if dirty_index > 0 {
                    dirty_index -= 1;
                    unsafe { *dirty_buffer.add(dirty_index) = entry };
                } else {
                    // Buffer full (or not yet installed).  The generic
                    // enqueue retires it and appends the card.
                    dcq.set_index(dirty_index);
                    self.dcqs.enqueue(dcq, p, stats);
                    dirty_buffer = dcq.buffer();
                    dirty_index = dcq.index();
                    flushed = true;
                }
            }
        }
        debug_assert_eq!(dirtied + filtered, written.len());
        stats.inc_written_cards_dirtied(dirtied);
        stats.inc_written_cards_filtered(filtered);
        // Finish recent bulk appends.
        dcq.set_index(dirty_index);
        flushed
    }

    /// If the queue is still on its spillover array, allocate a real
    /// buffer, move the spillover contents to its top, and rebase the
    /// cursor.  Returns true when that promotion happened.
    fn handle_full_indirect_initial_buffer(&self, wcq: &mut WrittenCardQueue) -> bool {
        let mode = self.mode;
        if !wcq.is_initial(mode) {
            return false;
        }
        let node = self.allocator.allocate();
        unsafe {
            let new_buffer = BufferNode::buffer_of(node);
            let index = (*node).capacity() - INITIAL_CAPACITY;
            // The spillover is copied whole; in Previous mode that moves
            // the sentinel into the new trailing slot.
            let initial = wcq.storage.indirect.initial;
            for (i, word) in initial.iter().enumerate() {
                *new_buffer.add(index + i) = *word;
            }
            wcq.storage.indirect.buffer = new_buffer;
            wcq.set_index(index, mode);
        }
        true
    }

    fn handle_full_buffer_inline<const SIZE_ADJUST: usize>(
        &self,
        gc: &mut GcThreadLocal,
        marker: Marker,
    ) {
        let mode = self.mode;
        debug_assert!(mode.inline_buffers);
        debug_assert_eq!(gc.wcq.index(), 0, "written card queue not full");
        let bufsize = INLINE_CAPACITY - SIZE_ADJUST;
        gc.stats.inc_written_cards(bufsize);
        gc.wcq.set_index(bufsize, mode);
        // Taken after the cursor update: the slice aliases the in-struct
        // array, so no further exclusive borrow of the queue may
        // intervene before it is consumed.
        let buffer = gc.wcq.buffer(mode);
        // The stores being tracked must happen-before the conditional
        // dirty marking.
        fence(Ordering::SeqCst);
        let written = unsafe { std::slice::from_raw_parts_mut(buffer, bufsize) };
        if marker(self, written, &mut gc.dcq, &mut gc.stats) {
            self.dcqs.mutator_refine_completed_buffer(&mut gc.stats);
        }
    }

    fn handle_full_buffer_indirect<const SIZE_ADJUST: usize>(
        &self,
        gc: &mut GcThreadLocal,
        marker: Marker,
    ) {
        let mode = self.mode;
        debug_assert!(!mode.inline_buffers);
        debug_assert_eq!(gc.wcq.index(), 0, "written card queue not full");
        if self.handle_full_indirect_initial_buffer(&mut gc.wcq) {
            return;
        }
        let buffer = unsafe { gc.wcq.storage.indirect.buffer };
        let node = unsafe { BufferNode::from_buffer(buffer) };
        let bufsize = unsafe { (*node).capacity() } - SIZE_ADJUST;
        gc.stats.inc_written_cards(bufsize);
        gc.wcq.set_index(bufsize, mode);
        // The stores being tracked must happen-before the conditional
        // dirty marking.
        fence(Ordering::SeqCst);
        let written = unsafe { std::slice::from_raw_parts_mut(buffer, bufsize) };
        if marker(self, written, &mut gc.dcq, &mut gc.stats) {
            self.dcqs.mutator_refine_completed_buffer(&mut gc.stats);
        }
    }

    fn handle_full_buffer_deferred<const SIZE_ADJUST: usize>(
        &self,
        gc: &mut GcThreadLocal,
        marker: Marker,
    ) {
        debug_assert_eq!(gc.wcq.index(), 0, "written card queue not full");
        if self.mutator_should_mark_cards_dirty() {
            self.handle_full_buffer_indirect::<SIZE_ADJUST>(gc, marker);
            return;
        }
        if self.handle_full_indirect_initial_buffer(&mut gc.wcq) {
            return;
        }
        let mode = self.mode;
        let old_buffer = unsafe { gc.wcq.storage.indirect.buffer };
        let new_node = self.allocator.allocate();
        let new_buffer = unsafe { BufferNode::buffer_of(new_node) };
        let bufsize = unsafe { (*new_node).capacity() } - SIZE_ADJUST;
        let old_node = unsafe { BufferNode::from_buffer(old_buffer) };
        unsafe { (*old_node).set_index(0) };
        gc.stats.inc_written_cards(unsafe { (*old_node).size() });
        self.enqueue_completed_buffer(old_node);
        unsafe { gc.wcq.storage.indirect.buffer = new_buffer };
        gc.wcq.set_index(bufsize, mode);
        if SIZE_ADJUST != 0 {
            debug_assert_eq!(SIZE_ADJUST, 1, "unexpected size adjustment");
            debug_assert_eq!(mode.filter, FilterMode::Previous);
            unsafe { *new_buffer.add(bufsize) = NO_MATCHING_CARD };
        }
    }

    // The nine overflow entry points, one per {storage} x {filter}.  A
    // barrier emitter jumps to the one matching the process configuration
    // when the fast path runs out of slots.  With written-card queues
    // disabled these are never reachable; they guard and return.

    pub fn handle_full_buffer_inline_none(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_inline::<0>(gc, Self::mark_cards_dirty_none_filtered);
    }

    pub fn handle_full_buffer_inline_young(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_inline::<0>(gc, Self::mark_cards_dirty_young_filtered);
    }

    pub fn handle_full_buffer_inline_previous(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_inline::<1>(gc, Self::mark_cards_dirty_previous_filtered);
    }

    pub fn handle_full_buffer_indirect_none(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_indirect::<0>(gc, Self::mark_cards_dirty_none_filtered);
    }

    pub fn handle_full_buffer_indirect_young(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_indirect::<0>(gc, Self::mark_cards_dirty_young_filtered);
    }

    pub fn handle_full_buffer_indirect_previous(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_indirect::<1>(gc, Self::mark_cards_dirty_previous_filtered);
    }

    pub fn handle_full_buffer_deferred_none(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_deferred::<0>(gc, Self::mark_cards_dirty_none_filtered);
    }

    pub fn handle_full_buffer_deferred_young(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_deferred::<0>(gc, Self::mark_cards_dirty_young_filtered);
    }

    pub fn handle_full_buffer_deferred_previous(&self, gc: &mut GcThreadLocal) {
        debug_assert!(self.use_queues);
        if !self.use_queues {
            return;
        }
        self.handle_full_buffer_deferred::<1>(gc, Self::mark_cards_dirty_previous_filtered);
    }

    /// Run the overflow handler matching the configuration.  This is the
    /// dispatch a Rust caller uses; an emitted barrier would target the
    /// concrete entry points directly.
    pub fn handle_full_buffer(&self, gc: &mut GcThreadLocal) {
        let mode = self.mode;
        if mode.inline_buffers {
            match mode.filter {
                FilterMode::None => self.handle_full_buffer_inline_none(gc),
                FilterMode::Young => self.handle_full_buffer_inline_young(gc),
                FilterMode::Previous => self.handle_full_buffer_inline_previous(gc),
            }
        } else if self.defer_dirtying {
            match mode.filter {
                FilterMode::None => self.handle_full_buffer_deferred_none(gc),
                FilterMode::Young => self.handle_full_buffer_deferred_young(gc),
                FilterMode::Previous => self.handle_full_buffer_deferred_previous(gc),
            }
        } else {
            match mode.filter {
                FilterMode::None => self.handle_full_buffer_indirect_none(gc),
                FilterMode::Young => self.handle_full_buffer_indirect_young(gc),
                FilterMode::Previous => self.handle_full_buffer_indirect_previous(gc),
            }
        }
    }
}
