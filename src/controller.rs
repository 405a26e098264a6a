//! Concurrent-refinement thread-count controller.
//!
//! Once per update period the controller predicts, from analytics, how
//! many refinement workers should run so the dirty-card count meets the
//! policy target by the next GC, and below which written-card backlog an
//! active worker may deactivate.  Secondary goals: run as few workers as
//! possible, avoid activation flapping, and delay work, since writes to
//! an already-dirty card are free.

use crate::stats::RefinementStats;

/// Prediction inputs, supplied by the policy's analytics machinery.
/// A zero rate means no estimate is available yet.
pub trait Analytics {
    /// Allocation rate, in regions per ms.
    fn predict_alloc_region_rate_ms(&self) -> f64;
    /// Rate at which mutators log written cards, per ms.
    fn predict_written_cards_rate_ms(&self) -> f64;
    /// Rate at which cards become dirty, per ms.
    fn predict_dirtied_cards_rate_ms(&self) -> f64;
    /// Per-thread rate of converting written cards to dirty cards, per ms.
    fn predict_concurrent_dirtying_rate_ms(&self) -> f64;
    /// Per-thread refinement rate, per ms.
    fn predict_concurrent_refine_rate_ms(&self) -> f64;
}

/// Fixed-rate analytics, for embedders without a predictor and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticAnalytics {
    pub alloc_region_rate_ms: f64,
    pub written_cards_rate_ms: f64,
    pub dirtied_cards_rate_ms: f64,
    pub concurrent_dirtying_rate_ms: f64,
    pub concurrent_refine_rate_ms: f64,
}

impl Analytics for StaticAnalytics {
    fn predict_alloc_region_rate_ms(&self) -> f64 {
        self.alloc_region_rate_ms
    }

    fn predict_written_cards_rate_ms(&self) -> f64 {
        self.written_cards_rate_ms
    }

    fn predict_dirtied_cards_rate_ms(&self) -> f64 {
        self.dirtied_cards_rate_ms
    }

    fn predict_concurrent_dirtying_rate_ms(&self) -> f64 {
        self.concurrent_dirtying_rate_ms
    }

    fn predict_concurrent_refine_rate_ms(&self) -> f64 {
        self.concurrent_refine_rate_ms
    }
}

/// Receives the pause-time stats summaries from the retirement task.
pub trait Policy: Send + Sync {
    fn record_concurrent_refinement_stats(
        &self,
        mutator_stats: RefinementStats,
        flush_stats: RefinementStats,
    );
}

/// Default policy: log the summaries.
#[derive(Debug, Default)]
pub struct LoggingPolicy;

impl Policy for LoggingPolicy {
    fn record_concurrent_refinement_stats(
        &self,
        mutator_stats: RefinementStats,
        flush_stats: RefinementStats,
    ) {
        log::debug!(
            "refinement stats: mutator dirtied {} filtered {}, flush-logs dirtied {} filtered {} written {}",
            mutator_stats.written_cards_dirtied(),
            mutator_stats.written_cards_filtered(),
            flush_stats.written_cards_dirtied(),
            flush_stats.written_cards_filtered(),
            flush_stats.written_cards(),
        );
    }
}

const ONE_HOUR_MS: f64 = 60.0 * 60.0 * 1000.0;

pub struct RefineThreadsNeeded {
    region_bytes: usize,
    update_period_ms: f64,
    defer_dirtying: bool,
    predicted_time_until_next_gc_ms: f64,
    predicted_written_cards_at_next_gc: usize,
    predicted_dirty_cards_at_next_gc: usize,
    written_cards_deactivation_threshold: usize,
    threads_needed: u32,
}

impl RefineThreadsNeeded {
    pub fn new(region_bytes: usize, update_period_ms: f64, defer_dirtying: bool) -> Self {
        RefineThreadsNeeded {
            region_bytes,
            update_period_ms,
            defer_dirtying,
            predicted_time_until_next_gc_ms: 0.0,
            predicted_written_cards_at_next_gc: 0,
            predicted_dirty_cards_at_next_gc: 0,
            written_cards_deactivation_threshold: 0,
            threads_needed: 0,
        }
    }

    pub fn threads_needed(&self) -> u32 {
        self.threads_needed
    }

    pub fn written_cards_deactivation_threshold(&self) -> usize {
        self.written_cards_deactivation_threshold
    }

    pub fn predicted_time_until_next_gc_ms(&self) -> f64 {
        self.predicted_time_until_next_gc_ms
    }

    pub fn predicted_written_cards_at_next_gc(&self) -> usize {
        self.predicted_written_cards_at_next_gc
    }

    pub fn predicted_dirty_cards_at_next_gc(&self) -> usize {
        self.predicted_dirty_cards_at_next_gc
    }

    /// Recompute the thread-count target and the deactivation threshold.
    pub fn update(
        &mut self,
        analytics: &dyn Analytics,
        active_threads: u32,
        available_bytes: usize,
        num_written_cards: usize,
        num_dirty_cards: usize,
        target_num_dirty_cards: usize,
    ) {
        // Time until the next GC, from the remaining allocatable bytes
        // and the allocation rate.
        let alloc_region_rate = analytics.predict_alloc_region_rate_ms();
        let alloc_bytes_rate = alloc_region_rate * self.region_bytes as f64;
        if alloc_bytes_rate == 0.0 {
            // No data yet; no idea how long until the next GC.
            self.predicted_time_until_next_gc_ms = 0.0;
        } else {
            // A large heap with a slow allocator can predict a next-GC
            // time big enough to overflow downstream arithmetic.  One
            // hour is still forever here.
            let raw_time_ms = available_bytes as f64 / alloc_bytes_rate;
            self.predicted_time_until_next_gc_ms = raw_time_ms.min(ONE_HOUR_MS);
        }

        let incoming_written_rate = analytics.predict_written_cards_rate_ms();
        let total_written_cards =
            self.predict_cards_at_next_gc(num_written_cards, incoming_written_rate);
        self.predicted_written_cards_at_next_gc = total_written_cards;

        let incoming_dirty_rate = analytics.predict_dirtied_cards_rate_ms();
        let total_dirty_cards = self.predict_cards_at_next_gc(num_dirty_cards, incoming_dirty_rate);
        self.predicted_dirty_cards_at_next_gc = total_dirty_cards;

        // Until better data says otherwise, never deactivate while any
        // written cards remain.
        self.written_cards_deactivation_threshold = 0;

        // The thread-count calculation is unstable when time is short and
        // can start lots of threads for little profit.  In the last
        // update period, keep what is running (counting the caller).
        // Mutator dirtying and refinement get activated for the pause, so
        // the backlog stops growing on its own.
        if self.predicted_time_until_next_gc_ms <= self.update_period_ms {
            self.threads_needed = active_threads.max(1);
            return;
        }

        // With no per-thread rate estimates at all, request one running
        // thread; the processing it does is what warms up the predictor.
        let dirtying_rate = analytics.predict_concurrent_dirtying_rate_ms();
        let refine_rate = analytics.predict_concurrent_refine_rate_ms();
        if dirtying_rate == 0.0 && refine_rate == 0.0 {
            self.threads_needed = 1;
            return;
        }

        let mut nthreads = 0.0f64;

        // Refinement demand: the dirty cards beyond the target must be
        // refined before the next GC.
        let cards_to_refine = total_dirty_cards.saturating_sub(target_num_dirty_cards);
        if cards_to_refine > 0 {
            if refine_rate == 0.0 {
                // No estimate; one thread covers this part until the
                // predictor warms up.
                nthreads += 1.0;
            } else {
                nthreads += self.estimate_threads_needed(cards_to_refine, refine_rate);
            }
        }

        // Dirtying demand, only with deferred dirtying enabled.
        if self.defer_dirtying {
            // Deactivation limit: the cards one thread can process in
            // half an update period.  A large pending backlog keeps
            // threads active to drive it down quickly.
            self.written_cards_deactivation_threshold =
                (dirtying_rate * (self.update_period_ms / 2.0)) as usize;
            if dirtying_rate == 0.0 {
                nthreads += 1.0;
            } else {
                // Drive pending written cards toward zero: they are cheap
                // to process and pending ones blur the dirty-card
                // estimates the refinement demand is computed from.  But
                // running many workers disturbs mutators, so take the
                // smallest of several candidates.
                let minimum = self.estimate_threads_needed(total_written_cards, dirtying_rate);
                let period_capacity = dirtying_rate * self.update_period_ms;
                let period_incoming = incoming_dirty_rate * self.update_period_ms;
                let period_target = num_written_cards as f64 + period_incoming;
                let period_threads = period_target / period_capacity;
                nthreads += (minimum + 1.0).min(2.0 * minimum).min(period_threads);
            }
        }

        // Integralize.  Rounding up always runs counter to delaying
        // work, so round to nearest, except near the next GC where we
        // drive toward the target.  At least one: the caller is the
        // primary refinement thread and deactivates itself if idle.
        if nthreads <= 1.0 {
            nthreads = 1.0;
        } else if self.predicted_time_until_next_gc_ms <= self.update_period_ms * 5.0 {
            nthreads = nthreads.ceil();
        } else {
            nthreads = nthreads.round();
        }

        self.threads_needed = nthreads.min(u32::MAX as f64) as u32;
        log::trace!(
            "refine threads needed: {} (deactivate below {} written cards, {:.1}ms to gc)",
            self.threads_needed,
            self.written_cards_deactivation_threshold,
            self.predicted_time_until_next_gc_ms,
        );
    }

    fn predict_cards_at_next_gc(&self, num_cards: usize, incoming_rate_ms: f64) -> usize {
        let incoming_cards = (incoming_rate_ms * self.predicted_time_until_next_gc_ms) as usize;
        num_cards + incoming_cards
    }

    fn estimate_threads_needed(&self, num_cards: usize, processing_rate_ms: f64) -> f64 {
        let thread_capacity = processing_rate_ms * self.predicted_time_until_next_gc_ms;
        num_cards as f64 / thread_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn controller(defer: bool) -> RefineThreadsNeeded {
        RefineThreadsNeeded::new(MIB, 5.0, defer)
    }

    #[test]
    fn short_horizon_keeps_active_threads() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 1.0, // 1 MiB/ms with 1 MiB regions
            concurrent_refine_rate_ms: 50.0,
            ..StaticAnalytics::default()
        };
        // 4 MiB available at 1 MiB/ms: 4ms to GC, below the 5ms period.
        c.update(&analytics, 3, 4 * MIB, 1000, 1000, 0);
        assert_eq!(c.threads_needed(), 3);
        assert_eq!(c.written_cards_deactivation_threshold(), 0);
        assert!((c.predicted_time_until_next_gc_ms() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn short_horizon_counts_the_caller() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 1.0,
            ..StaticAnalytics::default()
        };
        c.update(&analytics, 0, MIB, 0, 0, 0);
        assert_eq!(c.threads_needed(), 1);
    }

    #[test]
    fn warm_up_requests_one_thread() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 0.001, // long horizon
            ..StaticAnalytics::default()
        };
        c.update(&analytics, 7, 100 * MIB, 5000, 5000, 0);
        assert_eq!(c.threads_needed(), 1);
    }

    #[test]
    fn time_to_gc_is_clamped_to_one_hour() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 1e-9,
            concurrent_refine_rate_ms: 1.0,
            ..StaticAnalytics::default()
        };
        c.update(&analytics, 1, usize::MAX / 2, 0, 0, 0);
        assert_eq!(c.predicted_time_until_next_gc_ms(), 60.0 * 60.0 * 1000.0);
    }

    #[test]
    fn refine_demand_scales_with_excess_dirty_cards() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 0.01, // 100ms to GC with 1 MiB available
            concurrent_refine_rate_ms: 1.0,
            ..StaticAnalytics::default()
        };
        // 600 excess cards at 1 card/ms over 100ms: 6 threads.  100ms is
        // beyond 5 periods, so round-to-nearest applies.
        c.update(&analytics, 1, MIB, 0, 1100, 500);
        assert_eq!(c.threads_needed(), 6);
    }

    #[test]
    fn deferred_dirtying_sets_deactivation_threshold() {
        let mut c = controller(true);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 0.01,
            concurrent_dirtying_rate_ms: 100.0,
            concurrent_refine_rate_ms: 10.0,
            ..StaticAnalytics::default()
        };
        c.update(&analytics, 1, MIB, 2000, 0, 1000);
        // One thread's work in half a period: 100 cards/ms * 2.5ms.
        assert_eq!(c.written_cards_deactivation_threshold(), 250);
        assert!(c.threads_needed() >= 1);
    }

    #[test]
    fn predictions_include_incoming_cards() {
        let mut c = controller(false);
        let analytics = StaticAnalytics {
            alloc_region_rate_ms: 0.01, // 100ms horizon
            written_cards_rate_ms: 10.0,
            dirtied_cards_rate_ms: 5.0,
            concurrent_refine_rate_ms: 100.0,
            ..StaticAnalytics::default()
        };
        c.update(&analytics, 1, MIB, 100, 200, 10_000);
        assert_eq!(c.predicted_written_cards_at_next_gc(), 100 + 1000);
        assert_eq!(c.predicted_dirty_cards_at_next_gc(), 200 + 500);
        // Target above prediction: no refinement demand, one thread.
        assert_eq!(c.threads_needed(), 1);
    }
}
