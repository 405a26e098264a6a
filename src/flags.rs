//! Process-level collector flags.
//!
//! These mirror the command-line switches of the embedding runtime.  The
//! flag set is fixed before any mutator thread attaches; components copy
//! the bits they need at construction so tests can run several differently
//! configured barrier instances in one process.

use crate::error::{CardGripError, CardGripResult};

/// Filtering applied by the write barrier before logging a written card.
///
/// The value stored in the written-card queue depends on the mode:
///
/// * `None` — no filtering; entries are the raw written addresses.
/// * `Young` — the barrier skips young-generation cards; entries are
///   card-table byte pointers.
/// * `Previous` — the barrier drops sequential writes to the same card;
///   entries are card indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FilterMode {
    #[default]
    None = 0,
    Young = 1,
    Previous = 2,
}

impl TryFrom<u32> for FilterMode {
    type Error = CardGripError;

    fn try_from(value: u32) -> CardGripResult<Self> {
        match value {
            0 => Ok(FilterMode::None),
            1 => Ok(FilterMode::Young),
            2 => Ok(FilterMode::Previous),
            other => Err(CardGripError::InvalidFilter(other)),
        }
    }
}

/// The full process-level flag set.
#[derive(Debug, Clone)]
pub struct CollectorFlags {
    /// Log writes through per-thread written-card queues instead of
    /// dirtying cards directly in the barrier.
    pub use_written_card_queues: bool,
    /// Store written-card entries in a small array inside the queue
    /// structure rather than in heap buffers.
    pub use_inline_written_card_buffers: bool,
    /// Hand filled written-card buffers to the global list without
    /// dirtying; refinement threads perform the clean-to-dirty
    /// transition later.
    pub defer_dirtying_written_cards: bool,
    /// Barrier-side filtering mode.
    pub written_card_filter: FilterMode,
    /// Capacity (entries) of SATB log buffers.  The SATB queue itself is
    /// owned by the marking subsystem; the size is configured here because
    /// all three log allocators share one flag surface.
    pub satb_buffer_size: usize,
    /// Capacity (entries) of heap-allocated written-card buffers.
    pub written_card_buffer_size: usize,
    /// Capacity (entries) of dirty-card buffers.
    pub update_buffer_size: usize,
}

impl Default for CollectorFlags {
    fn default() -> Self {
        CollectorFlags {
            use_written_card_queues: true,
            use_inline_written_card_buffers: false,
            defer_dirtying_written_cards: false,
            written_card_filter: FilterMode::None,
            satb_buffer_size: 1024,
            written_card_buffer_size: 512,
            update_buffer_size: 256,
        }
    }
}

impl CollectorFlags {
    /// Validate cross-flag constraints.
    ///
    /// Deferred dirtying publishes whole buffers, which requires the
    /// indirect layout; the `Previous` filter needs room for its trailing
    /// sentinel.
    pub fn validate(&self) -> CardGripResult<()> {
        if self.defer_dirtying_written_cards && self.use_inline_written_card_buffers {
            return Err(CardGripError::Config(
                "deferred dirtying requires indirect written-card buffers",
            ));
        }
        if self.written_card_buffer_size < 4 {
            return Err(CardGripError::BufferCapacity(self.written_card_buffer_size));
        }
        if self.update_buffer_size < 1 {
            return Err(CardGripError::BufferCapacity(self.update_buffer_size));
        }
        Ok(())
    }

    pub fn queue_mode(&self) -> QueueMode {
        QueueMode {
            inline_buffers: self.use_inline_written_card_buffers,
            filter: self.written_card_filter,
        }
    }
}

/// The two bits of flag state the written-card queue needs on every
/// operation, copied out of [`CollectorFlags`] at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMode {
    pub inline_buffers: bool,
    pub filter: FilterMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_round_trip() {
        for raw in 0..3u32 {
            let mode = FilterMode::try_from(raw).unwrap();
            assert_eq!(mode as u32, raw);
        }
        assert!(FilterMode::try_from(3).is_err());
    }

    #[test]
    fn deferred_dirtying_rejects_inline_buffers() {
        let flags = CollectorFlags {
            defer_dirtying_written_cards: true,
            use_inline_written_card_buffers: true,
            ..CollectorFlags::default()
        };
        assert!(flags.validate().is_err());
        assert!(CollectorFlags::default().validate().is_ok());
    }
}
