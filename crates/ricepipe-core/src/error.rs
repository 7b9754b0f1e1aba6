//! Error types for stream primitives

use thiserror::Error;

/// Channel operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The producer already called `close`
    #[error("Write after close: the channel was already closed by its producer")]
    WriteAfterClose,

    /// The consuming side was dropped before the item could be queued
    #[error("Channel receiver dropped")]
    ReceiverDropped,
}

/// Concurrency operator construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    #[error("Invalid concurrency limit {limit}: must be at least 1")]
    InvalidLimit { limit: usize },
}
