//! Per-thread dirty-card queues and their global set.
//!
//! A dirty-card queue logs card-table entry pointers whose cards were
//! just marked dirty; refinement consumes them.  The queue is the plain
//! fill-downward buffer shape from [`crate::buffer`]; the set owns the
//! allocator, the completed-buffer list, and the counters refinement
//! control reads.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_epoch as epoch;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::buffer::{drain_chain, BufferAllocator, BufferNode, BufferStack};
use crate::stats::RefinementStats;

/// Thread-local log of card-table entry pointers.
///
/// The buffer is installed lazily on first enqueue; `index() == 0` with
/// no buffer makes the first enqueue take the install path.
pub struct DirtyCardQueue {
    node: *mut BufferNode,
    index: usize,
}

// Safety: the queue owns its buffer node exclusively; moving the queue
// moves that ownership.
unsafe impl Send for DirtyCardQueue {}

impl DirtyCardQueue {
    pub const fn new() -> Self {
        DirtyCardQueue {
            node: std::ptr::null_mut(),
            index: 0,
        }
    }

    /// Pointer to the element array, or null when no buffer is installed.
    pub fn buffer(&self) -> *mut usize {
        if self.node.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { BufferNode::buffer_of(self.node) }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Update the fill cursor after a bulk append.  With no installed
    /// buffer only zero is meaningful.
    pub fn set_index(&mut self, index: usize) {
        if self.node.is_null() {
            debug_assert_eq!(index, 0, "cursor without buffer");
        } else {
            debug_assert!(index <= self.capacity(), "cursor past capacity");
        }
        self.index = index;
    }

    pub fn capacity(&self) -> usize {
        if self.node.is_null() {
            0
        } else {
            unsafe { (*self.node).capacity() }
        }
    }

    pub fn size(&self) -> usize {
        self.capacity() - self.index
    }

    pub fn is_empty(&self) -> bool {
        self.node.is_null() || self.index == self.capacity()
    }

    fn install(&mut self, node: *mut BufferNode) {
        debug_assert!(self.node.is_null());
        self.index = unsafe { (*node).capacity() };
        self.node = node;
    }

    fn detach(&mut self) -> *mut BufferNode {
        let node = self.node;
        if !node.is_null() {
            unsafe { (*node).set_index(self.index) };
        }
        self.node = std::ptr::null_mut();
        self.index = 0;
        node
    }
}

impl Default for DirtyCardQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DirtyCardQueue {
    fn drop(&mut self) {
        debug_assert!(self.is_empty(), "dirty card queue dropped with entries");
        if !self.node.is_null() {
            // An empty installed buffer (left by reset_queue) has no
            // owner to return to; free it directly.
            unsafe { BufferNode::deallocate(self.node) };
        }
    }
}

struct NodePtr(*mut BufferNode);
// Safety: a paused node is owned by the paused list alone.
unsafe impl Send for NodePtr {}

/// Global state shared by every dirty-card queue.
pub struct DirtyCardQueueSet {
    allocator: Arc<BufferAllocator>,
    completed: BufferStack,
    num_cards: CachePadded<AtomicUsize>,
    /// Buffers a refinement worker set aside mid-processing.  Drained
    /// back onto the completed list at the start of each pause.
    paused: Mutex<Vec<NodePtr>>,
    /// Completed-card count above which a mutator that just filled a
    /// buffer performs one unit of refinement itself.  `usize::MAX`
    /// disables mutator self-service.
    mutator_refinement_threshold: AtomicUsize,
    /// Stats of threads that detached since the last pause.
    detached_stats: Mutex<RefinementStats>,
}

impl DirtyCardQueueSet {
    pub fn new(allocator: Arc<BufferAllocator>) -> Self {
        DirtyCardQueueSet {
            allocator,
            completed: BufferStack::new(),
            num_cards: CachePadded::new(AtomicUsize::new(0)),
            paused: Mutex::new(Vec::new()),
            mutator_refinement_threshold: AtomicUsize::new(usize::MAX),
            detached_stats: Mutex::new(RefinementStats::new()),
        }
    }

    pub fn allocator(&self) -> &Arc<BufferAllocator> {
        &self.allocator
    }

    /// Published count of cards sitting in completed buffers.  Never an
    /// undercount: incremented before a buffer is linked, decremented
    /// after it is unlinked.
    pub fn num_cards(&self) -> usize {
        self.num_cards.load(Ordering::Acquire)
    }

    pub fn mutator_refinement_threshold(&self) -> usize {
        self.mutator_refinement_threshold.load(Ordering::Acquire)
    }

    pub fn set_mutator_refinement_threshold(&self, value: usize) {
        self.mutator_refinement_threshold.store(value, Ordering::Release);
    }

    /// Append one card-entry pointer, retiring a full buffer to the
    /// completed list first when necessary.
    pub fn enqueue(
        &self,
        dcq: &mut DirtyCardQueue,
        card_ptr: *const AtomicU8,
        _stats: &mut RefinementStats,
    ) {
        if dcq.node.is_null() {
            dcq.install(self.allocator.allocate());
        } else if dcq.index == 0 {
            let full = dcq.detach();
            self.enqueue_completed_buffer(full);
            dcq.install(self.allocator.allocate());
        }
        dcq.index -= 1;
        unsafe { *dcq.buffer().add(dcq.index) = card_ptr as usize };
    }

    /// Publish a buffer to the completed list.
    pub fn enqueue_completed_buffer(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        let size = unsafe { (*node).size() };
        self.num_cards.fetch_add(size, Ordering::AcqRel);
        self.completed.push(node);
    }

    /// Pop one completed buffer, or null when the list is empty.
    pub fn take_completed_buffer(&self) -> *mut BufferNode {
        let node = {
            let guard = epoch::pin();
            self.completed.pop(&guard)
        };
        if !node.is_null() {
            let size = unsafe { (*node).size() };
            self.num_cards.fetch_sub(size, Ordering::AcqRel);
        }
        node
    }

    /// One unit of mutator self-service refinement, performed after a
    /// full-buffer handoff when the backlog exceeds the threshold.
    ///
    /// Processing a refined card belongs to the remembered-set updater;
    /// this records the work against `stats` and recycles the buffer.
    pub fn mutator_refine_completed_buffer(&self, stats: &mut RefinementStats) -> bool {
        if self.num_cards() <= self.mutator_refinement_threshold() {
            return false;
        }
        let node = self.take_completed_buffer();
        if node.is_null() {
            return false;
        }
        let start = Instant::now();
        let refined = unsafe { (*node).size() };
        self.allocator.release(node);
        stats.inc_refined_cards(refined);
        stats.inc_refinement_time(start.elapsed());
        true
    }

    /// Move the queue's buffer, full or partial, to the completed list.
    /// Empty buffers go straight back to the pool.
    pub fn flush_queue(&self, dcq: &mut DirtyCardQueue, _stats: &mut RefinementStats) {
        let node = dcq.detach();
        if node.is_null() {
            return;
        }
        if unsafe { (*node).is_empty() } {
            self.allocator.release(node);
        } else {
            self.enqueue_completed_buffer(node);
        }
    }

    /// Discard the queue's contents, keeping the installed buffer.
    pub fn reset_queue(&self, dcq: &mut DirtyCardQueue) {
        if !dcq.node.is_null() {
            dcq.index = dcq.capacity();
        }
    }

    /// Set aside a buffer mid-refinement, to be requeued at the next
    /// pause.
    pub fn pause_buffer(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        self.paused.lock().push(NodePtr(node));
    }

    /// Requeue every paused buffer.  Runs serially at a safepoint, before
    /// any parallel sub-task touches the completed list.
    pub fn enqueue_all_paused_buffers(&self) {
        let paused = std::mem::take(&mut *self.paused.lock());
        for NodePtr(node) in paused {
            if unsafe { (*node).is_empty() } {
                self.allocator.release(node);
            } else {
                self.enqueue_completed_buffer(node);
            }
        }
    }

    /// Safepoint-only: drop all completed and paused buffers and the
    /// detached-thread stats.
    pub fn abandon_completed_buffers_and_stats(&self) {
        self.enqueue_all_paused_buffers();
        drain_chain(self.completed.pop_all(), |node| {
            self.allocator.release(node);
        });
        self.num_cards.store(0, Ordering::Release);
        self.detached_stats.lock().reset();
    }

    /// Fold a detaching thread's stats into the set.
    pub fn record_detached_refinement_stats(&self, stats: &RefinementStats) {
        *self.detached_stats.lock() += *stats;
    }

    pub fn get_and_reset_detached_refinement_stats(&self) -> RefinementStats {
        let mut guard = self.detached_stats.lock();
        let out = *guard;
        guard.reset();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_table::{CardTable, DEFAULT_CARD_SHIFT};

    fn setup() -> (DirtyCardQueueSet, CardTable) {
        let allocator = Arc::new(BufferAllocator::new("dc test", 4, 2));
        (DirtyCardQueueSet::new(allocator), CardTable::new(0, 1 << 16, DEFAULT_CARD_SHIFT))
    }

    #[test]
    fn enqueue_installs_and_retires_buffers() {
        let (dcqs, ct) = setup();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::new();

        for i in 0..4usize {
            dcqs.enqueue(&mut dcq, ct.byte_for(i << DEFAULT_CARD_SHIFT), &mut stats);
        }
        assert_eq!(dcq.size(), 4);
        assert_eq!(dcqs.num_cards(), 0);

        // Fifth card retires the full buffer.
        dcqs.enqueue(&mut dcq, ct.byte_for(4 << DEFAULT_CARD_SHIFT), &mut stats);
        assert_eq!(dcqs.num_cards(), 4);
        assert_eq!(dcq.size(), 1);

        dcqs.flush_queue(&mut dcq, &mut stats);
        assert_eq!(dcqs.num_cards(), 5);
        assert!(dcq.is_empty());

        dcqs.abandon_completed_buffers_and_stats();
        assert_eq!(dcqs.num_cards(), 0);
    }

    #[test]
    fn push_then_pop_preserves_num_cards() {
        let (dcqs, ct) = setup();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::new();
        for i in 0..4usize {
            dcqs.enqueue(&mut dcq, ct.byte_for(i << DEFAULT_CARD_SHIFT), &mut stats);
        }
        let before = dcqs.num_cards();
        let node = dcq.detach();
        dcqs.enqueue_completed_buffer(node);
        let taken = dcqs.take_completed_buffer();
        assert_eq!(taken, node);
        assert_eq!(dcqs.num_cards(), before);
        dcqs.allocator().release(taken);
    }

    #[test]
    fn paused_buffers_return_at_safepoint() {
        let (dcqs, ct) = setup();
        let mut dcq = DirtyCardQueue::new();
        let mut stats = RefinementStats::new();
        for i in 0..4usize {
            dcqs.enqueue(&mut dcq, ct.byte_for(i << DEFAULT_CARD_SHIFT), &mut stats);
        }
        let node = dcq.detach();
        dcqs.pause_buffer(node);
        assert_eq!(dcqs.num_cards(), 0);
        dcqs.enqueue_all_paused_buffers();
        assert_eq!(dcqs.num_cards(), 4);
        dcqs.abandon_completed_buffers_and_stats();
    }

    #[test]
    fn detached_stats_accumulate_and_reset() {
        let (dcqs, _ct) = setup();
        let mut s = RefinementStats::new();
        s.inc_dirtied_cards(11);
        dcqs.record_detached_refinement_stats(&s);
        dcqs.record_detached_refinement_stats(&s);
        let total = dcqs.get_and_reset_detached_refinement_stats();
        assert_eq!(total.dirtied_cards(), 22);
        assert_eq!(dcqs.get_and_reset_detached_refinement_stats(), RefinementStats::new());
    }
}
