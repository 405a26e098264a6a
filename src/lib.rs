//! Mutator-side card tracking and concurrent refinement control for a
//! regionalized, generational, mostly-concurrent collector.
//!
//! Mutator threads log written locations into per-thread written-card
//! queues; the logs become dirtied cards, and dirtied cards feed
//! background refinement.  This crate provides the queues, the buffer
//! machinery underneath them, the safepoint-time retirement of all
//! per-thread logs, and the controller that sizes the refinement worker
//! pool.  The object heap, card scanning, and remembered-set updates
//! belong to the embedding collector.

pub mod barrier;
pub mod buffer;
pub mod card_table;
pub mod controller;
pub mod crash;
pub mod dirty;
pub mod error;
pub mod flags;
pub mod intrusive;
pub mod refine;
pub mod retirement;
pub mod stats;
pub mod thread;
pub mod written;

pub use barrier::PostBarrier;
pub use card_table::{CardTable, CardValue, CLEAN_CARD, DIRTY_CARD, YOUNG_CARD};
pub use controller::{Analytics, LoggingPolicy, Policy, RefineThreadsNeeded, StaticAnalytics};
pub use error::{CardGripError, CardGripResult};
pub use flags::{CollectorFlags, FilterMode, QueueMode};
pub use refine::{RefineScheduler, WorkerState};
pub use retirement::PreEvacuateRetirementTask;
pub use stats::RefinementStats;
pub use thread::{MutatorThread, ThreadKind, ThreadRegistry};
pub use written::{WrittenCardQueue, WrittenCardQueueSet};
