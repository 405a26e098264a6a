//! Refinement worker scheduling.
//!
//! The controller publishes a thread-count target and a written-card
//! deactivation threshold; workers obey them.  Worker `i` runs while
//! `i < threads_needed`.  An active worker with nothing processed, a
//! written-card backlog at or below the threshold, and no dirty-card
//! work parks itself; a publish that raises the target wakes the
//! affected workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::Backoff;
use flume::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::controller::RefineThreadsNeeded;
use crate::dirty::{DirtyCardQueue, DirtyCardQueueSet};
use crate::stats::RefinementStats;
use crate::written::WrittenCardQueueSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Active,
    Parked,
}

/// Snapshot of the controller's outputs, swapped in atomically.
#[derive(Debug, Clone, Copy)]
struct ControlOutputs {
    threads_needed: u32,
    deactivation_threshold: usize,
}

/// A worker's queue and stats, reachable from the retirement task's
/// serial sub-task while the worker is stopped at the safepoint.
pub(crate) struct WorkerGc {
    pub dcq: DirtyCardQueue,
    pub stats: RefinementStats,
}

struct WorkerShared {
    index: u32,
    state: AtomicCell<WorkerState>,
    stop: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    gc: Mutex<WorkerGc>,
}

pub struct RefineScheduler {
    wcqs: Arc<WrittenCardQueueSet>,
    dcqs: Arc<DirtyCardQueueSet>,
    outputs: ArcSwap<ControlOutputs>,
    workers: Vec<Arc<WorkerShared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RefineScheduler {
    /// Spawn `max_workers` refinement workers, all initially parked.
    pub fn start(
        wcqs: Arc<WrittenCardQueueSet>,
        dcqs: Arc<DirtyCardQueueSet>,
        max_workers: u32,
    ) -> Arc<Self> {
        let workers: Vec<Arc<WorkerShared>> = (0..max_workers)
            .map(|index| {
                let (wake_tx, wake_rx) = flume::bounded(1);
                Arc::new(WorkerShared {
                    index,
                    state: AtomicCell::new(WorkerState::Parked),
                    stop: AtomicBool::new(false),
                    wake_tx,
                    wake_rx,
                    gc: Mutex::new(WorkerGc {
                        dcq: DirtyCardQueue::new(),
                        stats: RefinementStats::new(),
                    }),
                })
            })
            .collect();

        let scheduler = Arc::new(RefineScheduler {
            wcqs,
            dcqs,
            outputs: ArcSwap::from_pointee(ControlOutputs {
                threads_needed: 0,
                deactivation_threshold: 0,
            }),
            workers,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(max_workers as usize);
        for worker in &scheduler.workers {
            let scheduler = Arc::clone(&scheduler);
            let worker = Arc::clone(worker);
            let handle = std::thread::Builder::new()
                .name(format!("refine-worker-{}", worker.index))
                .spawn(move || scheduler.run_worker(&worker))
                .expect("failed to spawn refinement worker");
            handles.push(handle);
        }
        *scheduler.handles.lock() = handles;
        scheduler
    }

    pub fn worker_count(&self) -> u32 {
        self.workers.len() as u32
    }

    pub fn worker_state(&self, index: u32) -> WorkerState {
        self.workers[index as usize].state.load()
    }

    /// Number of workers the last publish allowed to run.
    pub fn threads_needed(&self) -> u32 {
        self.outputs.load().threads_needed
    }

    /// Publish new controller outputs and wake the workers they cover.
    pub fn publish(&self, threads_needed: u32, deactivation_threshold: usize) {
        self.outputs.store(Arc::new(ControlOutputs {
            threads_needed,
            deactivation_threshold,
        }));
        for worker in self.workers.iter().take(threads_needed as usize) {
            let _ = worker.wake_tx.try_send(());
        }
    }

    /// Convenience: publish straight from a freshly updated controller.
    pub fn publish_from(&self, controller: &RefineThreadsNeeded) {
        self.publish(
            controller.threads_needed(),
            controller.written_cards_deactivation_threshold(),
        );
    }

    /// Flush every worker's dirty-card queue to the global set.  Runs in
    /// the retirement task's serial sub-task, with workers stopped at the
    /// safepoint.
    pub fn flush_worker_queues(&self, flush_stats: &mut RefinementStats) {
        for worker in &self.workers {
            let mut gc = worker.gc.lock();
            let WorkerGc { dcq, stats } = &mut *gc;
            self.dcqs.flush_queue(dcq, stats);
            *flush_stats += *stats;
            stats.reset();
        }
    }

    /// Stop and join all workers.  Their queues are flushed first.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.wake_tx.try_send(());
        }
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
        let mut sink = RefinementStats::new();
        self.flush_worker_queues(&mut sink);
    }

    fn run_worker(&self, worker: &WorkerShared) {
        let backoff = Backoff::new();
        loop {
            if worker.stop.load(Ordering::Acquire) {
                return;
            }
            let outputs = **self.outputs.load();
            if worker.index >= outputs.threads_needed {
                self.park(worker);
                continue;
            }
            worker.state.store(WorkerState::Active);

            let (processed_written, processed_dirty) = {
                let mut gc = worker.gc.lock();
                let WorkerGc { dcq, stats } = &mut *gc;
                let processed_written = self.wcqs.mark_cards_dirty(dcq, stats);
                let processed_dirty = self.refine_one_dirty_buffer(stats);
                (processed_written, processed_dirty)
            };

            if processed_written || processed_dirty {
                backoff.reset();
                continue;
            }
            // Out of work.  Deactivate if the written backlog is small
            // enough; otherwise wait for more buffers to show up.
            if self.wcqs.num_cards() <= outputs.deactivation_threshold {
                self.park(worker);
            } else {
                backoff.snooze();
            }
        }
    }

    fn park(&self, worker: &WorkerShared) {
        // Drain a stale wakeup so the recv below really blocks.
        match worker.wake_rx.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }
        worker.state.store(WorkerState::Parked);
        let _ = worker.wake_rx.recv();
        worker.state.store(WorkerState::Active);
    }

    /// Process one completed dirty buffer.  Converting a dirty card into
    /// remembered-set entries belongs to the collector; here the work is
    /// accounted and the buffer recycled.
    fn refine_one_dirty_buffer(&self, stats: &mut RefinementStats) -> bool {
        let node = self.dcqs.take_completed_buffer();
        if node.is_null() {
            return false;
        }
        let start = Instant::now();
        let refined = unsafe { (*node).size() };
        self.dcqs.allocator().release(node);
        stats.inc_refined_cards(refined);
        stats.inc_refinement_time(start.elapsed());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::PostBarrier;
    use crate::card_table::{CardTable, DEFAULT_CARD_SHIFT};
    use crate::flags::CollectorFlags;
    use crate::thread::ThreadKind;
    use std::time::Duration;

    fn deferred_barrier() -> Arc<PostBarrier> {
        let flags = CollectorFlags {
            defer_dirtying_written_cards: true,
            ..CollectorFlags::default()
        };
        let ct = Arc::new(CardTable::new(0, 1 << 22, DEFAULT_CARD_SHIFT));
        PostBarrier::new(flags, ct).unwrap()
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn workers_start_parked_and_obey_the_target() {
        let barrier = deferred_barrier();
        let scheduler = RefineScheduler::start(
            Arc::clone(barrier.written_card_queue_set()),
            Arc::clone(barrier.dirty_card_queue_set()),
            3,
        );
        assert_eq!(scheduler.worker_state(0), WorkerState::Parked);
        assert_eq!(scheduler.worker_state(2), WorkerState::Parked);
        scheduler.publish(0, 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(scheduler.worker_state(0), WorkerState::Parked);
        scheduler.shutdown();
    }

    #[test]
    fn deferred_buffers_get_drained_by_a_woken_worker() {
        let barrier = deferred_barrier();
        let wcqs = Arc::clone(barrier.written_card_queue_set());
        let scheduler =
            RefineScheduler::start(Arc::clone(&wcqs), Arc::clone(barrier.dirty_card_queue_set()), 2);

        // Fill one full written buffer through the deferred overflow path.
        let thread = barrier.on_thread_create(ThreadKind::Mutator);
        let buffer_size = barrier.flags().written_card_buffer_size;
        for i in 0..buffer_size + 8 {
            barrier.write_ref_field_post(&thread, 0x10000 + i * 0x600);
        }
        assert!(wcqs.num_cards() > 0);

        scheduler.publish(1, 0);
        assert!(wait_until(Duration::from_secs(5), || wcqs.num_cards() == 0));
        scheduler.shutdown();
    }
}
