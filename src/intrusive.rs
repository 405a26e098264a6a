//! Intrusive doubly-linked list.
//!
//! Elements embed a [`ListLink`]; an [`Adapter`] tells the list where to
//! find it.  Link targets are an explicit tagged variant — an element, the
//! list root, or unlinked — rather than a low-bit-tagged pointer, so a
//! corrupt link is distinguishable from an empty one in a debugger.
//!
//! The list itself is not synchronized.  All operations require `&mut
//! self`; concurrent users wrap the list in a lock and the embedded links
//! are only ever touched while that lock is held.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// Where a link points.
pub enum LinkTarget<T> {
    /// Not on any list.
    Unlinked,
    /// Points at the list root: the element is first (for `prev`) or
    /// last (for `next`).
    Root,
    /// Points at a neighboring element.
    Elem(NonNull<T>),
}

impl<T> Clone for LinkTarget<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LinkTarget<T> {}

/// Link embedded in list elements.
pub struct ListLink<T> {
    prev: UnsafeCell<LinkTarget<T>>,
    next: UnsafeCell<LinkTarget<T>>,
}

// Safety: links are only read or written while the owning list is
// exclusively borrowed; see module docs.
unsafe impl<T> Send for ListLink<T> {}
unsafe impl<T> Sync for ListLink<T> {}

impl<T> ListLink<T> {
    pub const fn new() -> Self {
        ListLink {
            prev: UnsafeCell::new(LinkTarget::Unlinked),
            next: UnsafeCell::new(LinkTarget::Unlinked),
        }
    }

    /// Whether the element is currently on a list.  Only meaningful while
    /// the list lock is held.
    pub fn is_linked(&self) -> bool {
        !matches!(unsafe { *self.prev.get() }, LinkTarget::Unlinked)
    }

    unsafe fn set(&self, prev: LinkTarget<T>, next: LinkTarget<T>) {
        unsafe {
            *self.prev.get() = prev;
            *self.next.get() = next;
        }
    }
}

impl<T> Default for ListLink<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locates the embedded link inside an element.
///
/// # Safety
///
/// `link` must always return the same link for the same element, and the
/// link must live exactly as long as the element.
pub unsafe trait Adapter {
    type Elem;
    fn link(elem: &Self::Elem) -> &ListLink<Self::Elem>;
}

/// Doubly-linked list over `Arc<A::Elem>` elements.
///
/// The list owns one strong reference per linked element; `remove` gives
/// it back.
pub struct IntrusiveList<A: Adapter> {
    head: LinkTarget<A::Elem>,
    tail: LinkTarget<A::Elem>,
    len: usize,
    _adapter: PhantomData<A>,
}

// Safety: the raw element pointers reachable from head/tail originate
// from Arcs, which are Send/Sync for Send+Sync elements.
unsafe impl<A: Adapter> Send for IntrusiveList<A> where A::Elem: Send + Sync {}

impl<A: Adapter> IntrusiveList<A> {
    pub const fn new() -> Self {
        IntrusiveList {
            head: LinkTarget::Unlinked,
            tail: LinkTarget::Unlinked,
            len: 0,
            _adapter: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `elem`.  The element must not already be on a list.
    pub fn push_back(&mut self, elem: Arc<A::Elem>) {
        assert!(!A::link(&elem).is_linked(), "element already on a list");
        let raw = NonNull::new(Arc::into_raw(elem) as *mut A::Elem).unwrap();
        let link = unsafe { A::link(raw.as_ref()) };
        match self.tail {
            LinkTarget::Elem(old_tail) => {
                unsafe {
                    link.set(LinkTarget::Elem(old_tail), LinkTarget::Root);
                    *A::link(old_tail.as_ref()).next.get() = LinkTarget::Elem(raw);
                }
                self.tail = LinkTarget::Elem(raw);
            }
            _ => {
                unsafe { link.set(LinkTarget::Root, LinkTarget::Root) };
                self.head = LinkTarget::Elem(raw);
                self.tail = LinkTarget::Elem(raw);
            }
        }
        self.len += 1;
    }

    /// Unlink `elem` and return the list's reference to it.
    ///
    /// Panics if `elem` is not on this list; removing a foreign element
    /// is a programming error.
    pub fn remove(&mut self, elem: &A::Elem) -> Arc<A::Elem> {
        let link = A::link(elem);
        assert!(link.is_linked(), "element not on a list");
        let (prev, next) = unsafe { (*link.prev.get(), *link.next.get()) };

        match prev {
            LinkTarget::Elem(p) => unsafe {
                *A::link(p.as_ref()).next.get() = next;
            },
            LinkTarget::Root => self.head = next,
            LinkTarget::Unlinked => unreachable!(),
        }
        match next {
            LinkTarget::Elem(n) => unsafe {
                *A::link(n.as_ref()).prev.get() = prev;
            },
            LinkTarget::Root => self.tail = prev,
            LinkTarget::Unlinked => unreachable!(),
        }
        unsafe { link.set(LinkTarget::Unlinked, LinkTarget::Unlinked) };
        self.len -= 1;
        // Safety: push_back leaked exactly one strong reference for this
        // element; reclaim it.
        unsafe { Arc::from_raw(elem as *const A::Elem) }
    }

    /// Visit every element front to back.
    pub fn for_each(&self, mut f: impl FnMut(&A::Elem)) {
        let mut cursor = self.head;
        while let LinkTarget::Elem(node) = cursor {
            let elem = unsafe { node.as_ref() };
            f(elem);
            cursor = unsafe { *A::link(elem).next.get() };
        }
    }

    /// Snapshot the elements as owned references.
    pub fn snapshot(&self) -> Vec<Arc<A::Elem>> {
        let mut out = Vec::with_capacity(self.len);
        self.for_each(|elem| {
            // Safety: elem came from an Arc; manufacture a new strong ref.
            unsafe {
                Arc::increment_strong_count(elem as *const A::Elem);
                out.push(Arc::from_raw(elem as *const A::Elem));
            }
        });
        out
    }
}

impl<A: Adapter> Default for IntrusiveList<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Adapter> Drop for IntrusiveList<A> {
    fn drop(&mut self) {
        let mut cursor = self.head;
        while let LinkTarget::Elem(node) = cursor {
            unsafe {
                let elem = node.as_ref();
                cursor = *A::link(elem).next.get();
                A::link(elem).set(LinkTarget::Unlinked, LinkTarget::Unlinked);
                drop(Arc::from_raw(elem as *const A::Elem));
            }
        }
    }
}
