//! # ricepipe-cache
//!
//! Disk-backed memoization for pipeline results. Values are stored as timestamped
//! JSON files named by a SHA-256 digest of their key, and read back as misses once
//! they are older than the staleness window (24 hours unless configured).
//!
//! ## Features
//!
//! - **Composite keys**: a single string or an ordered list of strings
//! - **Staleness window**: configurable per cache
//! - **Self-healing**: corrupt entries are logged, removed and treated as misses
//! - **Compute-on-miss**: [`ResultCache::get_or_compute`] wraps any fallible future

pub mod cache;
pub mod error;
pub mod key;

pub use cache::{CacheEntry, ResultCache, DEFAULT_STALENESS};
pub use error::{CacheError, Result};
pub use key::CacheKey;
