//! Pipeline error types

use std::io;
use std::sync::Arc;

use ricepipe_cache::CacheError;
use ricepipe_core::{ChannelError, ConcurrencyError};
use ricepipe_process::ProcessError;
use thiserror::Error;

/// Errors surfaced to a pipeline's consumer
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// One failure delivered to several `tee` branches
    #[error(transparent)]
    Shared(Arc<PipelineError>),

    /// Failure raised by a user-supplied closure
    #[error("{0}")]
    Message(String),
}

impl PipelineError {
    pub fn msg(message: impl Into<String>) -> Self {
        PipelineError::Message(message.into())
    }

    /// Wrap for fan-out without nesting an already shared error
    pub(crate) fn into_shared(self) -> Arc<PipelineError> {
        match self {
            PipelineError::Shared(shared) => shared,
            other => Arc::new(other),
        }
    }

    /// The underlying process error, looking through `Shared`
    pub fn process_error(&self) -> Option<&ProcessError> {
        match self {
            PipelineError::Process(err) => Some(err),
            PipelineError::Shared(shared) => shared.process_error(),
            _ => None,
        }
    }

    /// Exit code of a process that exited unsuccessfully
    pub fn exit_code(&self) -> Option<i32> {
        self.process_error().and_then(ProcessError::exit_code)
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
