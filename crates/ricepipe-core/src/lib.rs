//! # ricepipe-core
//!
//! **Purpose**: Stream primitives shared by every ricepipe layer
//!
//! Nothing in this crate knows about processes. It provides the three pieces of
//! plumbing the process layer and the `Pipeline` type are assembled from.
//!
//! ## Features
//!
//! - **Line Scanning**: Split arbitrary byte chunks into lines, carrying partial lines
//!   across chunk boundaries
//! - **Channel**: Capacity-one push/pull bridge so imperative producers can feed a
//!   consumer-driven stream with backpressure
//! - **Bounded Concurrency**: Ordered and unordered concurrent mapping with a sliding
//!   admission window
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::{stream, StreamExt};
//! use std::convert::Infallible;
//! use ricepipe_core::concurrent_map;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = stream::iter(vec![Ok::<_, Infallible>(1), Ok(2), Ok(3)]);
//! let doubled = concurrent_map(source, |n| async move { Ok(n * 2) }, 2)?;
//! let results: Vec<_> = doubled.collect().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod concurrency;
pub mod error;
pub mod scanner;

pub use channel::{channel, ChannelReader, ChannelWriter};
pub use concurrency::{
    concurrent_map, concurrent_unordered_map, default_concurrency, ConcurrentMap,
    ConcurrentUnorderedMap,
};
pub use error::{ChannelError, ConcurrencyError};
pub use scanner::{ByteLines, LineBatches, LineScanner, RawLine, TextLine};
