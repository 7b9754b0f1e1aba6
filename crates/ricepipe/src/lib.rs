//! # ricepipe
//!
//! **Purpose**: Fluent async pipelines over values and external processes
//!
//! A [`Pipeline`] chains transforms over a lazily evaluated sequence and can hand the
//! sequence to a process as stdin, continuing with that process's stdout.
//!
//! ## Features
//!
//! - **Operators**: map, filter, flat_map, take, skip, zip/unzip, tee, concat
//! - **Bounded Concurrency**: ordered and completion-order concurrent maps
//! - **Processes**: `run` feeds stdin and streams stdout with exit-status errors
//! - **Lines**: byte chunks split into text or byte lines across chunk boundaries
//! - **Push Sources**: [`channel`] bridges imperative producers with backpressure
//! - **Handlers**: pluggable [`InputHandler`]/[`OutputHandler`] bindings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ricepipe::{Pipeline, ProcessSpec};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let matches = Pipeline::from_iter(["a", "b", "bc", "d"])
//!     .run_lines(ProcessSpec::new("grep").arg("b"))
//!     .collect()
//!     .await?;
//! assert_eq!(matches, vec!["b", "bc"]);
//! # Ok(())
//! # }
//! ```

pub mod bindings;
pub mod config;
pub mod error;
pub mod exec;
pub mod handlers;
pub mod pipeline;
mod tee;
mod zip;

use bytes::Bytes;
use ricepipe_core::ChannelWriter;

pub use bindings::{BytesInput, CollectOutput, Collected, LineOutput, StreamInput, StreamOutput};
pub use config::{ConfigError, PipelineConfig, StderrMode};
pub use error::{PipelineError, Result};
pub use exec::{execute, Execution, RunOptions};
pub use handlers::{Encoding, InputHandler, OutputHandler, StdinItem};
pub use pipeline::Pipeline;
pub use ricepipe_process::{
    CommandIdentity, ExitOutcome, PipeMode, ProcessContext, ProcessError, ProcessSpec,
    StderrPolicy,
};
pub use tokio_util::sync::CancellationToken;

/// Spawn `spec` without feeding stdin and stream its stdout
///
/// The process is spawned when the pipeline is first polled.
pub fn exec(spec: ProcessSpec) -> Pipeline<Bytes> {
    Pipeline::defer(async move {
        let output = Execution::new(spec).output()?;
        Ok(Pipeline::from_try_stream(output))
    })
}

/// Writer half feeding a pipeline, with one-slot backpressure
///
/// Closing the writer with an error makes the pipeline yield it after the items
/// already written.
///
/// ```rust
/// # tokio_test::block_on(async {
/// let (mut writer, pipeline) = ricepipe::channel::<u32>();
/// let producer = async move {
///     writer.write(1).await.unwrap();
///     writer.write(2).await.unwrap();
///     writer.close(None).await;
/// };
/// let (_, doubled) = tokio::join!(producer, pipeline.map(|n| n * 2).collect());
/// assert_eq!(doubled.unwrap(), vec![2, 4]);
/// # });
/// ```
pub fn channel<T: Send + 'static>() -> (ChannelWriter<T, PipelineError>, Pipeline<T>) {
    let (writer, reader) = ricepipe_core::channel();
    (writer, Pipeline::from_channel(reader))
}
