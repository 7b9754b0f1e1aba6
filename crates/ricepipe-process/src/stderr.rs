//! Stderr processing and failure handling
//!
//! A [`StderrPolicy`] pairs two caller-supplied pieces:
//!
//! - a **processor** that drains the child's stderr and returns an optional summary
//! - an **error handler** that receives the exit-status/signal/stream error together
//!   with that summary and decides whether to raise it
//!
//! The default policy mirrors stderr to the host's stderr and raises the error.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{ProcessError, Result};

/// Chunks read from a child's stderr
pub type StderrChunks = BoxStream<'static, Result<Bytes>>;

type Processor = Box<dyn FnOnce(StderrChunks) -> BoxFuture<'static, Option<String>> + Send>;
type Handler = Box<dyn FnOnce(ProcessError, Option<String>) -> Result<()> + Send>;

/// Default error handler: attach the summary and raise
pub fn raise_with_stderr(error: ProcessError, summary: Option<String>) -> Result<()> {
    Err(error.with_stderr(summary))
}

/// How stderr is drained and how failures are reported
pub struct StderrPolicy {
    processor: Processor,
    handler: Handler,
}

impl StderrPolicy {
    /// Copy stderr to the host's stderr as it arrives
    pub fn mirror() -> Self {
        Self::custom(mirror_to_host, raise_with_stderr)
    }

    /// Keep the last `limit` bytes of stderr and embed them in failures
    pub fn capture(limit: usize) -> Self {
        Self::custom(move |chunks| capture_tail(chunks, limit), raise_with_stderr)
    }

    /// Drain and ignore stderr
    pub fn discard() -> Self {
        Self::custom(
            |mut chunks: StderrChunks| async move {
                while let Some(chunk) = chunks.next().await {
                    if chunk.is_err() {
                        break;
                    }
                }
                None
            },
            raise_with_stderr,
        )
    }

    /// Fully custom processor and handler
    pub fn custom<P, Fut, H>(processor: P, handler: H) -> Self
    where
        P: FnOnce(StderrChunks) -> Fut + Send + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
        H: FnOnce(ProcessError, Option<String>) -> Result<()> + Send + 'static,
    {
        Self {
            processor: Box::new(move |chunks| processor(chunks).boxed()),
            handler: Box::new(handler),
        }
    }

    /// Replace the error handler, keeping the processor
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: FnOnce(ProcessError, Option<String>) -> Result<()> + Send + 'static,
    {
        self.handler = Box::new(handler);
        self
    }

    pub(crate) fn into_parts(self) -> (Processor, Handler) {
        (self.processor, self.handler)
    }
}

impl Default for StderrPolicy {
    fn default() -> Self {
        Self::mirror()
    }
}

impl fmt::Debug for StderrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StderrPolicy").finish_non_exhaustive()
    }
}

async fn mirror_to_host(mut chunks: StderrChunks) -> Option<String> {
    let mut host = tokio::io::stderr();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(err) = host.write_all(&bytes).await {
                    warn!(error = %err, "Failed to mirror child stderr");
                }
            }
            Err(err) => {
                warn!(error = %err, "Stopped reading child stderr");
                break;
            }
        }
    }
    if let Err(err) = host.flush().await {
        warn!(error = %err, "Failed to flush mirrored stderr");
    }
    None
}

async fn capture_tail(mut chunks: StderrChunks, limit: usize) -> Option<String> {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit.min(8192));
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                tail.extend(bytes.iter());
                let excess = tail.len().saturating_sub(limit);
                tail.drain(..excess);
            }
            Err(err) => {
                warn!(error = %err, "Stopped reading child stderr");
                break;
            }
        }
    }

    if tail.is_empty() {
        return None;
    }
    let bytes: Vec<u8> = tail.into_iter().collect();
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
