//! Mutator thread objects and the thread registry.
//!
//! Each thread owns its written-card queue, dirty-card queue, refinement
//! stats, and TLAB.  That state lives on the thread object behind a lock
//! rather than in thread-local storage, so safepoint tasks can reach any
//! thread's queues and the accessor stays usable from contexts where TLS
//! is off-limits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dirty::DirtyCardQueue;
use crate::error::{CardGripError, CardGripResult};
use crate::flags::QueueMode;
use crate::intrusive::{Adapter, IntrusiveList, ListLink};
use crate::stats::RefinementStats;
use crate::written::WrittenCardQueue;

/// What a registered thread does for a living.  Utility threads never
/// run the write barrier, so their written-card queues stay empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Mutator,
    Utility,
}

/// Minimal thread-local allocation buffer: enough state to retire and
/// account for it at the pre-evacuation pause.
#[derive(Debug, Default)]
pub struct Tlab {
    used_bytes: usize,
    refills: usize,
}

impl Tlab {
    pub fn note_refill(&mut self, bytes: usize) {
        self.refills += 1;
        self.used_bytes += bytes;
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Give the buffer back to the heap and account for it.
    pub fn retire(&mut self, stats: &mut TlabStats) {
        stats.retirements += 1;
        stats.retired_bytes += self.used_bytes;
        stats.refills += self.refills;
        self.used_bytes = 0;
        self.refills = 0;
    }
}

/// Summable TLAB retirement statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlabStats {
    pub retirements: usize,
    pub retired_bytes: usize,
    pub refills: usize,
}

impl TlabStats {
    pub fn update(&mut self, other: TlabStats) {
        self.retirements += other.retirements;
        self.retired_bytes += other.retired_bytes;
        self.refills += other.refills;
    }

    pub fn publish(&self) {
        log::debug!(
            "tlab retirement: {} buffers, {} bytes, {} refills",
            self.retirements,
            self.retired_bytes,
            self.refills
        );
    }
}

/// The per-thread GC state the barrier and safepoint tasks operate on.
pub struct GcThreadLocal {
    pub wcq: WrittenCardQueue,
    pub dcq: DirtyCardQueue,
    pub stats: RefinementStats,
    pub tlab: Tlab,
}

impl GcThreadLocal {
    pub fn new(mode: QueueMode) -> Self {
        GcThreadLocal {
            wcq: WrittenCardQueue::new(mode),
            dcq: DirtyCardQueue::new(),
            stats: RefinementStats::new(),
            tlab: Tlab::default(),
        }
    }
}

pub struct MutatorInner {
    id: usize,
    kind: ThreadKind,
    link: ListLink<MutatorInner>,
    gc: Mutex<GcThreadLocal>,
}

/// Handle to a registered thread.  Cheap to clone; all clones share the
/// same per-thread state.
#[derive(Clone)]
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
}

impl MutatorThread {
    pub fn new(id: usize, kind: ThreadKind, mode: QueueMode) -> Self {
        MutatorThread {
            inner: Arc::new(MutatorInner {
                id,
                kind,
                link: ListLink::new(),
                gc: Mutex::new(GcThreadLocal::new(mode)),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.inner.kind
    }

    /// Run `f` with exclusive access to this thread's GC state.  The
    /// owning thread's uncontended lock is the fast path; safepoint tasks
    /// take the same lock when the owner is stopped.
    pub fn with_gc_data<R>(&self, f: impl FnOnce(&mut GcThreadLocal) -> R) -> R {
        f(&mut self.inner.gc.lock())
    }

    fn from_inner(inner: Arc<MutatorInner>) -> Self {
        MutatorThread { inner }
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

struct ThreadAdapter;

// Safety: the link is a plain field of MutatorInner.
unsafe impl Adapter for ThreadAdapter {
    type Elem = MutatorInner;
    fn link(elem: &MutatorInner) -> &ListLink<MutatorInner> {
        &elem.link
    }
}

/// Registry of every attached thread.
pub struct ThreadRegistry {
    threads: Mutex<IntrusiveList<ThreadAdapter>>,
    next_id: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry {
            threads: Mutex::new(IntrusiveList::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn next_thread_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, thread: &MutatorThread) {
        self.threads.lock().push_back(Arc::clone(&thread.inner));
    }

    pub fn unregister(&self, thread: &MutatorThread) -> CardGripResult<()> {
        let mut guard = self.threads.lock();
        if !thread.inner.link.is_linked() {
            return Err(CardGripError::Thread(format!(
                "thread {} not registered",
                thread.id()
            )));
        }
        guard.remove(&thread.inner);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Snapshot of the registered threads, in registration order.
    pub fn snapshot(&self) -> Vec<MutatorThread> {
        self.threads
            .lock()
            .snapshot()
            .into_iter()
            .map(MutatorThread::from_inner)
            .collect()
    }

    pub fn mutator_threads(&self) -> Vec<MutatorThread> {
        self.snapshot()
            .into_iter()
            .filter(|t| t.kind() == ThreadKind::Mutator)
            .collect()
    }

    pub fn utility_threads(&self) -> Vec<MutatorThread> {
        self.snapshot()
            .into_iter()
            .filter(|t| t.kind() == ThreadKind::Utility)
            .collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
