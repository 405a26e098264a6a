//! Pre-evacuation batched retirement.
//!
//! Runs at the start of every evacuation pause, with mutators stopped:
//! retires TLABs, drains every thread's written- and dirty-card logs into
//! the global sets, and hands the accumulated statistics to the policy.
//! One serial sweep covers utility threads, one covers the refinement
//! workers' queues (deferred dirtying only), and the mutator threads are
//! chunked across pause workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::barrier::PostBarrier;
use crate::controller::Policy;
use crate::dirty::{DirtyCardQueue, DirtyCardQueueSet};
use crate::refine::RefineScheduler;
use crate::stats::RefinementStats;
use crate::thread::{GcThreadLocal, MutatorThread, TlabStats};

/// There is relatively little work to do per thread.
const THREADS_PER_WORKER: usize = 250;

#[derive(Default)]
struct WorkerLocal {
    tlab_stats: TlabStats,
    mutator_stats: RefinementStats,
    flushlogs_stats: RefinementStats,
}

/// Flush a partial dirty buffer to the global list, accumulating the
/// flushed count for later reporting.
fn flush_dirty_card_queue(
    dcqs: &DirtyCardQueueSet,
    dcq: &mut DirtyCardQueue,
    stats: &mut RefinementStats,
) {
    if !dcq.is_empty() {
        dcqs.flush_queue(dcq, stats);
    }
}

/// Fold the thread's stats into the accumulator and reset them.
fn collect_refinement_stats(gc: &mut GcThreadLocal, accumulated: &mut RefinementStats) {
    *accumulated += gc.stats;
    gc.stats.reset();
}

pub struct PreEvacuateRetirementTask {
    barrier: Arc<PostBarrier>,
    scheduler: Option<Arc<RefineScheduler>>,
    policy: Arc<dyn Policy>,
}

impl PreEvacuateRetirementTask {
    /// Prepare the pause: disable deferred mutator dirtying and mutator
    /// self-refinement until concurrent refinement decides otherwise, and
    /// requeue paused buffers.  Must run at a safepoint, before any
    /// parallel sub-task.
    pub fn new(
        barrier: Arc<PostBarrier>,
        scheduler: Option<Arc<RefineScheduler>>,
        policy: Arc<dyn Policy>,
    ) -> Self {
        let dcqs = barrier.dirty_card_queue_set();
        if barrier.flags().defer_dirtying_written_cards {
            barrier
                .written_card_queue_set()
                .set_mutator_should_mark_cards_dirty(false);
        }
        dcqs.set_mutator_refinement_threshold(usize::MAX);
        // Serially at a safepoint no one else touches the paused lists or
        // the global queue, so this is ABA-safe.
        dcqs.enqueue_all_paused_buffers();
        PreEvacuateRetirementTask {
            barrier,
            scheduler,
            policy,
        }
    }

    /// Run the sweeps with `num_workers` pause workers, then publish the
    /// summaries to the policy.
    pub fn execute(self, num_workers: usize) {
        assert!(num_workers > 0, "at least one pause worker");
        let flags = self.barrier.flags().clone();
        let wcqs = self.barrier.written_card_queue_set();
        let dcqs = self.barrier.dirty_card_queue_set();
        let defer = flags.defer_dirtying_written_cards && flags.use_written_card_queues;

        // Serial sub-task: utility threads never log written cards; flush
        // their dirty queues and stats.
        let mut non_java = WorkerLocal::default();
        for thread in self.barrier.registry().utility_threads() {
            thread.with_gc_data(|gc| {
                debug_assert!(
                    !flags.use_written_card_queues || gc.wcq.is_empty(wcqs.mode()),
                    "utility thread with non-empty written card queue"
                );
                flush_dirty_card_queue(dcqs, &mut gc.dcq, &mut non_java.flushlogs_stats);
                collect_refinement_stats(gc, &mut non_java.mutator_stats);
            });
        }

        // Serial sub-task: refinement workers own dirty-card queues only
        // when dirtying is deferred to them.
        let mut refine_flush_stats = RefinementStats::new();
        if defer {
            if let Some(scheduler) = &self.scheduler {
                scheduler.flush_worker_queues(&mut refine_flush_stats);
            }
        }

        // Parallel sub-task: mutator threads, chunked by a claimer.
        let threads = self.barrier.registry().mutator_threads();
        let locals: Vec<Mutex<WorkerLocal>> =
            (0..num_workers).map(|_| Mutex::new(WorkerLocal::default())).collect();
        let claimer = AtomicUsize::new(0);
        rayon::scope(|scope| {
            for local in &locals {
                let barrier = &self.barrier;
                let threads = &threads;
                let claimer = &claimer;
                scope.spawn(move |_| {
                    let mut local = local.lock();
                    loop {
                        let start = claimer.fetch_add(THREADS_PER_WORKER, Ordering::Relaxed);
                        if start >= threads.len() {
                            break;
                        }
                        let end = (start + THREADS_PER_WORKER).min(threads.len());
                        for thread in &threads[start..end] {
                            retire_thread(barrier, thread, &mut local);
                        }
                    }
                    if defer {
                        // Drain the global written-card backlog through a
                        // local queue until it runs dry.
                        let wcqs = barrier.written_card_queue_set();
                        let dcqs = barrier.dirty_card_queue_set();
                        let mut dcq = DirtyCardQueue::new();
                        while wcqs.mark_cards_dirty(&mut dcq, &mut local.flushlogs_stats) {}
                        dcqs.flush_queue(&mut dcq, &mut local.flushlogs_stats);
                    }
                });
            }
        });

        // Publish and verify, then hand the summaries to the policy.
        let mut tlab_stats = TlabStats::default();
        let mut mutator_stats = non_java.mutator_stats;
        let mut flushlogs_stats = non_java.flushlogs_stats;
        for local in &locals {
            let local = local.lock();
            tlab_stats.update(local.tlab_stats);
            mutator_stats += local.mutator_stats;
            flushlogs_stats += local.flushlogs_stats;
        }
        flushlogs_stats += refine_flush_stats;
        mutator_stats += dcqs.get_and_reset_detached_refinement_stats();
        tlab_stats.publish();
        self.verify_empty_dirty_card_logs();
        self.policy
            .record_concurrent_refinement_stats(mutator_stats, flushlogs_stats);
    }

    fn verify_empty_dirty_card_logs(&self) {
        if cfg!(debug_assertions) {
            for thread in self.barrier.registry().snapshot() {
                thread.with_gc_data(|gc| {
                    debug_assert!(
                        gc.dcq.is_empty(),
                        "non-empty dirty card queue for thread {}",
                        thread.id()
                    );
                });
            }
        }
    }
}

fn retire_thread(barrier: &PostBarrier, thread: &MutatorThread, local: &mut WorkerLocal) {
    // Flushes deferred card marks, so must precede concatenating logs.
    barrier.make_parsable(thread);
    let wcqs = barrier.written_card_queue_set();
    let dcqs = barrier.dirty_card_queue_set();
    thread.with_gc_data(|gc| {
        gc.tlab.retire(&mut local.tlab_stats);
        if barrier.flags().use_written_card_queues {
            let GcThreadLocal { wcq, dcq, .. } = gc;
            local.flushlogs_stats.inc_written_cards(wcq.size(wcqs.mode()));
            wcq.mark_cards_dirty(wcqs, dcq, &mut local.flushlogs_stats);
        }
        flush_dirty_card_queue(dcqs, &mut gc.dcq, &mut local.flushlogs_stats);
        collect_refinement_stats(gc, &mut local.mutator_stats);
    });
}
