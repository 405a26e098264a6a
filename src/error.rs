//! Error types for the cardgrip runtime.
//!
//! Programming-invariant violations (a non-empty queue at detach, an
//! unknown filter value reaching a dispatch) are treated as fatal and
//! assert; this type covers the recoverable configuration and registry
//! surface only.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CardGripError {
    #[error("invalid written-card filter value {0}")]
    InvalidFilter(u32),
    #[error("invalid collector configuration: {0}")]
    Config(&'static str),
    #[error("buffer capacity {0} unusable for the configured queues")]
    BufferCapacity(usize),
    #[error("thread registry error: {0}")]
    Thread(String),
}

pub type CardGripResult<T> = Result<T, CardGripError>;
