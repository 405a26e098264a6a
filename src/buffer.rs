//! Fixed-capacity log buffers and the structures that move them around.
//!
//! A buffer is one raw allocation: a small header ([`BufferNode`])
//! followed by `capacity` machine words, filled downward from the end.
//! Buffers flow mutator -> completed list -> refinement -> allocator and
//! back; the header's intrusive next pointer threads them through the
//! lock-free lists on that path.
//!
//! Reclamation discipline: a node popped from a [`BufferStack`] may be
//! examined by a concurrent popper that lost the race, so a released node
//! must not be handed out again while any such popper is still inside its
//! critical section.  [`BufferAllocator::release`] defers the return to
//! the free list through an epoch, which is what makes the Treiber-style
//! pop ABA-safe.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard};

/// Header preceding the element array of every log buffer.
#[repr(C)]
pub struct BufferNode {
    next: AtomicPtr<BufferNode>,
    /// Fill cursor, in elements.  `capacity` means empty; the buffer
    /// fills downward toward zero.
    index: AtomicUsize,
    capacity: usize,
    /// Allocation tag identifying the pool this node belongs to.
    tag: u32,
}

impl BufferNode {
    fn layout(capacity: usize) -> Layout {
        Layout::new::<BufferNode>()
            .extend(Layout::array::<usize>(capacity).expect("buffer layout overflow"))
            .expect("buffer layout overflow")
            .0
            .pad_to_align()
    }

    /// Allocate an empty node (`index == capacity`) with room for
    /// `capacity` elements.  Aborts on allocation failure; log buffers
    /// come from the process heap and exhaustion there is fatal.
    pub fn allocate(capacity: usize, tag: u32) -> *mut BufferNode {
        assert!(capacity > 0, "zero-capacity buffer");
        let layout = Self::layout(capacity);
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc(layout) } as *mut BufferNode;
        if raw.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        unsafe {
            ptr::write(
                raw,
                BufferNode {
                    next: AtomicPtr::new(ptr::null_mut()),
                    index: AtomicUsize::new(capacity),
                    capacity,
                    tag,
                },
            );
        }
        raw
    }

    /// Free a node previously produced by [`BufferNode::allocate`].
    ///
    /// # Safety
    ///
    /// `node` must be a live allocation from [`BufferNode::allocate`] and
    /// must not be reachable from any list.
    pub unsafe fn deallocate(node: *mut BufferNode) {
        let capacity = unsafe { (*node).capacity };
        unsafe { dealloc(node as *mut u8, Self::layout(capacity)) };
    }

    /// Pointer to the first element slot of `node`.
    ///
    /// # Safety
    ///
    /// `node` must be a live allocation from [`BufferNode::allocate`].
    #[inline]
    pub unsafe fn buffer_of(node: *mut BufferNode) -> *mut usize {
        unsafe { (node as *mut u8).add(std::mem::size_of::<BufferNode>()) as *mut usize }
    }

    /// Recover the header from a pointer to the first element slot.
    ///
    /// # Safety
    ///
    /// `buffer` must have been produced by [`BufferNode::buffer_of`].
    #[inline]
    pub unsafe fn from_buffer(buffer: *mut usize) -> *mut BufferNode {
        unsafe { (buffer as *mut u8).sub(std::mem::size_of::<BufferNode>()) as *mut BufferNode }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub fn set_index(&self, index: usize) {
        debug_assert!(index <= self.capacity, "index past capacity");
        self.index.store(index, Ordering::Relaxed);
    }

    /// Number of filled elements: `capacity - index`.
    pub fn size(&self) -> usize {
        self.capacity - self.index()
    }

    pub fn is_empty(&self) -> bool {
        self.index() == self.capacity
    }

    pub fn next(&self) -> *mut BufferNode {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, next: *mut BufferNode) {
        self.next.store(next, Ordering::Release);
    }
}

/// Lock-free LIFO of buffer nodes.
///
/// `push` is a plain compare-exchange loop and may run from any thread.
/// `pop` must run inside an epoch critical section (the caller-supplied
/// [`Guard`]); combined with epoch-deferred reclamation in the allocator
/// this rules out the ABA reuse that would otherwise corrupt the list.
/// `pop_all` detaches the whole chain and is intended for safepoint use.
pub struct BufferStack {
    top: AtomicPtr<BufferNode>,
}

impl BufferStack {
    pub const fn new() -> Self {
        BufferStack {
            top: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top.load(Ordering::Acquire).is_null()
    }

    /// Push `node`.  Wait-free apart from CAS retries under contention.
    pub fn push(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        let mut current = self.top.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(current, Ordering::Relaxed) };
            match self
                .top
                .compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Pop the most recently pushed node, or null when empty.
    ///
    /// The guard keeps any node we race on alive until we are done
    /// reading its next pointer.
    pub fn pop(&self, _guard: &Guard) -> *mut BufferNode {
        loop {
            let current = self.top.load(Ordering::Acquire);
            if current.is_null() {
                return ptr::null_mut();
            }
            // Safety: current was reachable from top inside our critical
            // section, so it cannot have been reclaimed yet.
            let next = unsafe { (*current).next.load(Ordering::Acquire) };
            if self
                .top
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                unsafe { (*current).next.store(ptr::null_mut(), Ordering::Relaxed) };
                return current;
            }
        }
    }

    /// Detach and return the entire chain.  Walk it with
    /// [`BufferNode::next`]; the final node's next is null.
    pub fn pop_all(&self) -> *mut BufferNode {
        self.top.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl Default for BufferStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate a chain detached by [`BufferStack::pop_all`], clearing the
/// next pointer of each node as it is yielded.
pub fn drain_chain(mut head: *mut BufferNode, mut f: impl FnMut(*mut BufferNode)) {
    while !head.is_null() {
        let node = head;
        unsafe {
            head = (*node).next.load(Ordering::Relaxed);
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        f(node);
    }
}

struct SendNode(*mut BufferNode);
// Safety: the node is unreachable from any list when deferred, and the
// closure that owns it is the only reference.
unsafe impl Send for SendNode {}

/// Free-list-backed pool of equally sized buffers.
pub struct BufferAllocator {
    name: &'static str,
    buffer_capacity: usize,
    tag: u32,
    free_list: Arc<BufferStack>,
    free_count: Arc<AtomicUsize>,
}

impl BufferAllocator {
    pub fn new(name: &'static str, buffer_capacity: usize, tag: u32) -> Self {
        BufferAllocator {
            name,
            buffer_capacity,
            tag,
            free_list: Arc::new(BufferStack::new()),
            free_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Approximate number of buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Return an empty buffer (`index == capacity`), reusing a released
    /// one when available.
    pub fn allocate(&self) -> *mut BufferNode {
        let guard = epoch::pin();
        let node = self.free_list.pop(&guard);
        if node.is_null() {
            BufferNode::allocate(self.buffer_capacity, self.tag)
        } else {
            self.free_count.fetch_sub(1, Ordering::Relaxed);
            unsafe {
                (*node).set_index(self.buffer_capacity);
                (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
            }
            node
        }
    }

    /// Return `node` to the pool.  Element contents are not touched; the
    /// node becomes reusable only after concurrent poppers have exited
    /// their critical sections.
    pub fn release(&self, node: *mut BufferNode) {
        debug_assert!(!node.is_null());
        debug_assert_eq!(unsafe { (*node).tag() }, self.tag, "node released to wrong pool");
        let list = Arc::clone(&self.free_list);
        let count = Arc::clone(&self.free_count);
        let deferred = SendNode(node);
        let guard = epoch::pin();
        // Safety: the captured Arcs keep the free list alive and the node
        // is unreachable until the closure runs.
        unsafe {
            guard.defer_unchecked(move || {
                let SendNode(node) = deferred;
                list.push(node);
                count.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        // Encourage pending deferred releases to run, then free whatever
        // made it onto the list.  Nodes still queued behind an epoch are
        // unreachable and simply leak, matching process-lifetime pools.
        epoch::pin().flush();
        drain_chain(self.free_list.pop_all(), |node| unsafe {
            BufferNode::deallocate(node);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_buffer_pointers_round_trip() {
        let node = BufferNode::allocate(64, 1);
        unsafe {
            let buf = BufferNode::buffer_of(node);
            assert_eq!(BufferNode::from_buffer(buf), node);
            assert_eq!((*node).capacity(), 64);
            assert!((*node).is_empty());
            BufferNode::deallocate(node);
        }
    }

    #[test]
    fn size_tracks_downward_fill() {
        let node = BufferNode::allocate(8, 1);
        unsafe {
            let buf = BufferNode::buffer_of(node);
            for i in (5..8).rev() {
                *buf.add(i) = i;
            }
            (*node).set_index(5);
            assert_eq!((*node).size(), 3);
            assert!(!(*node).is_empty());
            BufferNode::deallocate(node);
        }
    }

    #[test]
    fn stack_is_lifo() {
        let stack = BufferStack::new();
        let a = BufferNode::allocate(4, 1);
        let b = BufferNode::allocate(4, 1);
        stack.push(a);
        stack.push(b);
        let guard = epoch::pin();
        assert_eq!(stack.pop(&guard), b);
        assert_eq!(stack.pop(&guard), a);
        assert!(stack.pop(&guard).is_null());
        unsafe {
            BufferNode::deallocate(a);
            BufferNode::deallocate(b);
        }
    }

    #[test]
    fn pop_all_detaches_chain() {
        let stack = BufferStack::new();
        let nodes: Vec<_> = (0..5).map(|_| BufferNode::allocate(4, 1)).collect();
        for &n in &nodes {
            stack.push(n);
        }
        let mut drained = Vec::new();
        drain_chain(stack.pop_all(), |n| drained.push(n));
        assert!(stack.is_empty());
        let mut expected = nodes.clone();
        expected.reverse();
        assert_eq!(drained, expected);
        for n in nodes {
            unsafe { BufferNode::deallocate(n) };
        }
    }

    #[test]
    fn allocator_reuses_released_buffers() {
        let alloc = BufferAllocator::new("test", 16, 7);
        let node = alloc.allocate();
        unsafe { (*node).set_index(3) };
        alloc.release(node);
        // Deferred release: force epochs forward until the node lands on
        // the free list.
        for _ in 0..1000 {
            if alloc.free_count() > 0 {
                break;
            }
            epoch::pin().flush();
        }
        let again = alloc.allocate();
        // Whether or not we got the same node back, it must be empty.
        unsafe { assert!((*again).is_empty()) };
        alloc.release(again);
    }

    #[test]
    fn concurrent_push_pop_preserves_nodes() {
        let allocator = Arc::new(BufferAllocator::new("conc", 4, 1));
        let stack = Arc::new(BufferStack::new());
        let popped = Arc::new(AtomicUsize::new(0));
        crossbeam::scope(|s| {
            for _ in 0..4 {
                let stack = Arc::clone(&stack);
                let allocator = Arc::clone(&allocator);
                s.spawn(move |_| {
                    for _ in 0..100 {
                        stack.push(allocator.allocate());
                    }
                });
            }
            for _ in 0..2 {
                let stack = Arc::clone(&stack);
                let allocator = Arc::clone(&allocator);
                let popped = Arc::clone(&popped);
                s.spawn(move |_| loop {
                    let node = {
                        let guard = epoch::pin();
                        stack.pop(&guard)
                    };
                    if node.is_null() {
                        if popped.load(Ordering::Relaxed) >= 400 {
                            break;
                        }
                        std::thread::yield_now();
                        continue;
                    }
                    // Reuse is epoch-deferred, which is what keeps a
                    // racing popper's stale reference harmless.
                    allocator.release(node);
                    popped.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
        .unwrap();
        assert_eq!(popped.load(Ordering::Relaxed), 400);
        assert!(stack.is_empty());
    }
}
