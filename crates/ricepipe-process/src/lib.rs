//! # ricepipe-process
//!
//! **Purpose**: External processes as guarded, once-only streams
//!
//! Spawns a child from a [`ProcessSpec`] and exposes its stdin, stdout and stderr as
//! wrappers that release their OS handle exactly once. Consuming stdout through
//! [`ProcessOutput`] turns the exit status into typed errors.
//!
//! ## Features
//!
//! - **Spawning**: launch on `spawn`, per-stream pipe modes, env and working dir
//! - **Guarded Streams**: idempotent close, loud failure on use after close
//! - **Exit Taxonomy**: exit-status, signal and stream errors with chained causes
//! - **Stderr Policies**: mirror, capture, discard or custom processor + handler
//! - **Cancellation**: kill the child when a `CancellationToken` fires
//! - **Process Contexts**: tear down every tracked child with SIGTERM→SIGKILL
//!
//! ## Usage
//!
//! ```rust,no_run
//! use futures::TryStreamExt;
//! use ricepipe_process::{ProcessHandle, ProcessSpec, StderrPolicy};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = ProcessHandle::spawn(&ProcessSpec::new("ls").arg("-l"))?;
//! let chunks: Vec<_> = handle
//!     .into_output(None, StderrPolicy::capture(4096))?
//!     .try_collect()
//!     .await?;
//! println!("{} chunks", chunks.len());
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod guarded;
pub mod handle;
pub mod output;
pub mod spec;
pub mod stderr;

pub use context::{ProcessContext, Registration};
pub use error::{BoxError, CommandIdentity, ProcessError, Result, StreamRole};
pub use guarded::{Guarded, ReleaseCounts, StderrReader, StdinWriter, StdoutReader};
pub use handle::{ExitOutcome, ProcessHandle};
pub use output::{Feed, ProcessOutput};
pub use spec::{PipeMode, ProcessSpec};
pub use stderr::{raise_with_stderr, StderrChunks, StderrPolicy};
