//! Refinement statistics.
//!
//! A plain value type accumulated per thread and summed over collections
//! of threads.  The subtraction form exists so a caller can snapshot,
//! do work, and compute the delta.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefinementStats {
    refinement_time: Duration,
    refined_cards: usize,
    precleaned_cards: usize,
    dirtied_cards: usize,
    written_cards_processing_time: Duration,
    written_cards_dirtied: usize,
    written_cards_filtered: usize,
    written_cards: usize,
}

impl RefinementStats {
    pub const fn new() -> Self {
        RefinementStats {
            refinement_time: Duration::ZERO,
            refined_cards: 0,
            precleaned_cards: 0,
            dirtied_cards: 0,
            written_cards_processing_time: Duration::ZERO,
            written_cards_dirtied: 0,
            written_cards_filtered: 0,
            written_cards: 0,
        }
    }

    /// Time spent performing concurrent refinement.
    pub fn refinement_time(&self) -> Duration {
        self.refinement_time
    }

    /// Number of refined cards.
    pub fn refined_cards(&self) -> usize {
        self.refined_cards
    }

    /// Refinement rate, in cards per ms.  Zero when no time has been
    /// recorded yet.
    pub fn refinement_rate_ms(&self) -> f64 {
        rate_per_ms(self.refined_cards, self.refinement_time)
    }

    /// Cards for which refinement was skipped because another thread got
    /// there first.
    pub fn precleaned_cards(&self) -> usize {
        self.precleaned_cards
    }

    /// Cards marked dirty and in need of refinement.
    pub fn dirtied_cards(&self) -> usize {
        self.dirtied_cards
    }

    /// Time spent processing written cards.
    pub fn written_cards_processing_time(&self) -> Duration {
        self.written_cards_processing_time
    }

    /// Written cards whose card transitioned clean to dirty.
    pub fn written_cards_dirtied(&self) -> usize {
        self.written_cards_dirtied
    }

    /// Processed written cards discarded by filtering.
    pub fn written_cards_filtered(&self) -> usize {
        self.written_cards_filtered
    }

    /// Written cards processed: dirtied plus filtered.
    pub fn written_cards_processed(&self) -> usize {
        self.written_cards_dirtied + self.written_cards_filtered
    }

    /// Written cards logged by the barrier.
    pub fn written_cards(&self) -> usize {
        self.written_cards
    }

    /// Written-card processing rate, in cards per ms.
    pub fn written_cards_processing_rate_ms(&self) -> f64 {
        rate_per_ms(self.written_cards_processed(), self.written_cards_processing_time)
    }

    pub fn inc_refinement_time(&mut self, t: Duration) {
        self.refinement_time += t;
    }

    pub fn inc_refined_cards(&mut self, cards: usize) {
        self.refined_cards += cards;
    }

    pub fn inc_precleaned_cards(&mut self, cards: usize) {
        self.precleaned_cards += cards;
    }

    pub fn inc_dirtied_cards(&mut self, cards: usize) {
        self.dirtied_cards += cards;
    }

    pub fn inc_written_cards_processing_time(&mut self, t: Duration) {
        self.written_cards_processing_time += t;
    }

    pub fn inc_written_cards_dirtied(&mut self, cards: usize) {
        self.written_cards_dirtied += cards;
    }

    pub fn inc_written_cards_filtered(&mut self, cards: usize) {
        self.written_cards_filtered += cards;
    }

    pub fn inc_written_cards(&mut self, cards: usize) {
        self.written_cards += cards;
    }

    pub fn reset(&mut self) {
        *self = RefinementStats::new();
    }
}

fn rate_per_ms(count: usize, time: Duration) -> f64 {
    let ms = time.as_secs_f64() * 1000.0;
    if ms == 0.0 {
        0.0
    } else {
        count as f64 / ms
    }
}

impl AddAssign for RefinementStats {
    fn add_assign(&mut self, other: Self) {
        self.refinement_time += other.refinement_time;
        self.refined_cards += other.refined_cards;
        self.precleaned_cards += other.precleaned_cards;
        self.dirtied_cards += other.dirtied_cards;
        self.written_cards_processing_time += other.written_cards_processing_time;
        self.written_cards_dirtied += other.written_cards_dirtied;
        self.written_cards_filtered += other.written_cards_filtered;
        self.written_cards += other.written_cards;
    }
}

impl SubAssign for RefinementStats {
    fn sub_assign(&mut self, other: Self) {
        self.refinement_time -= other.refinement_time;
        self.refined_cards -= other.refined_cards;
        self.precleaned_cards -= other.precleaned_cards;
        self.dirtied_cards -= other.dirtied_cards;
        self.written_cards_processing_time -= other.written_cards_processing_time;
        self.written_cards_dirtied -= other.written_cards_dirtied;
        self.written_cards_filtered -= other.written_cards_filtered;
        self.written_cards -= other.written_cards;
    }
}

impl Add for RefinementStats {
    type Output = RefinementStats;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl Sub for RefinementStats {
    type Output = RefinementStats;

    fn sub(mut self, other: Self) -> Self {
        self -= other;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RefinementStats {
        let mut s = RefinementStats::new();
        s.inc_refinement_time(Duration::from_millis(10));
        s.inc_refined_cards(100);
        s.inc_dirtied_cards(7);
        s.inc_written_cards(40);
        s.inc_written_cards_dirtied(25);
        s.inc_written_cards_filtered(15);
        s.inc_written_cards_processing_time(Duration::from_millis(4));
        s
    }

    #[test]
    fn add_then_sub_is_identity() {
        let s = sample();
        let mut t = sample();
        t.inc_refined_cards(13);
        let original = t;
        t += s;
        t -= s;
        assert_eq!(t, original);
    }

    #[test]
    fn rates_handle_zero_time() {
        let empty = RefinementStats::new();
        assert_eq!(empty.refinement_rate_ms(), 0.0);
        assert_eq!(empty.written_cards_processing_rate_ms(), 0.0);

        let s = sample();
        assert!((s.refinement_rate_ms() - 10.0).abs() < 1e-9);
        assert!((s.written_cards_processing_rate_ms() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn processed_is_dirtied_plus_filtered() {
        let s = sample();
        assert_eq!(s.written_cards_processed(), 40);
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = sample();
        s.reset();
        assert_eq!(s, RefinementStats::new());
    }
}
