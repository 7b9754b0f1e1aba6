//! Cache-related error types

use thiserror::Error;

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Invalid cache key: {reason}")]
    InvalidKey { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
