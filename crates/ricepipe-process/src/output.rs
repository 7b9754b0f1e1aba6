//! Stdout consumption with coordinated exit handling
//!
//! [`ProcessOutput`] is the single place where exit-status, signal and stream
//! errors are produced. Polling it drives, on the consumer's task:
//!
//! - the stdout reads whose chunks it yields
//! - an optional stdin feed future
//! - the stderr processor
//! - the exit wait, once stdout is exhausted
//!
//! Dropping the stream drops all of them, which releases every descriptor.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_stream::stream;
use bytes::Bytes;
use futures::future::{BoxFuture, Fuse, FusedFuture};
use futures::stream::{BoxStream, FusedStream, Stream};
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BoxError, CommandIdentity, ProcessError, Result};
use crate::guarded::{StderrReader, StdoutReader};
use crate::handle::{ExitOutcome, ProcessHandle};
use crate::stderr::StderrPolicy;

/// Future writing the caller's input into stdin; it owns (and must close) the writer
pub type Feed = BoxFuture<'static, std::result::Result<(), BoxError>>;

struct Parts {
    handle: ProcessHandle,
    stdout: StdoutReader,
    stderr: Option<StderrReader>,
    feed: Option<Feed>,
    policy: StderrPolicy,
}

/// Byte chunks of a process's stdout, ending with the exit-status verdict
pub struct ProcessOutput {
    pid: u32,
    command: CommandIdentity,
    cancel: Option<CancellationToken>,
    parts: Option<Parts>,
    inner: Option<BoxStream<'static, Result<Bytes>>>,
}

impl ProcessOutput {
    pub(crate) fn new(
        handle: ProcessHandle,
        stdout: StdoutReader,
        stderr: Option<StderrReader>,
        feed: Option<Feed>,
        policy: StderrPolicy,
    ) -> Self {
        Self {
            pid: handle.pid(),
            command: handle.command().clone(),
            cancel: None,
            parts: Some(Parts {
                handle,
                stdout,
                stderr,
                feed,
                policy,
            }),
            inner: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandIdentity {
        &self.command
    }

    /// Kill the child and end with [`ProcessError::Cancelled`] once `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for ProcessOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOutput")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("started", &self.inner.is_some())
            .finish()
    }
}

impl Stream for ProcessOutput {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.inner.is_none() {
            match this.parts.take() {
                Some(parts) => {
                    let cancel = this.cancel.take().unwrap_or_default();
                    this.inner = Some(drive(parts, cancel).boxed());
                }
                None => return Poll::Ready(None),
            }
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl FusedStream for ProcessOutput {
    fn is_terminated(&self) -> bool {
        self.parts.is_none() && self.inner.is_none()
    }
}

enum Step {
    Chunk(Bytes),
    StdoutDone,
    ReadFailed(ProcessError),
    Exited(ExitOutcome),
    WaitFailed(ProcessError),
    Cancelled,
    Progress,
}

fn record_feed(
    result: std::result::Result<(), BoxError>,
    fault: &mut Option<BoxError>,
    pid: u32,
) {
    if let Err(err) = result {
        debug!(pid = %pid, error = %err, "Stdin feed failed");
        fault.get_or_insert(err);
    }
}

fn drive(parts: Parts, cancel: CancellationToken) -> impl Stream<Item = Result<Bytes>> + Send {
    stream! {
        let Parts { mut handle, mut stdout, stderr, feed, policy } = parts;
        let pid = handle.pid();
        let command = handle.command().clone();
        let (processor, handler) = policy.into_parts();

        // Stdin nobody is feeding would keep the child waiting forever
        handle.close().await;

        let mut feed: Fuse<Feed> = match feed {
            Some(feed) => feed.fuse(),
            None => Fuse::terminated(),
        };
        let mut drain: Fuse<BoxFuture<'static, Option<String>>> = match stderr {
            Some(reader) => processor(reader.into_chunks()).fuse(),
            None => Fuse::terminated(),
        };
        let mut summary: Option<String> = None;
        let mut feed_fault: Option<BoxError> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                result = &mut feed, if !feed.is_terminated() => {
                    record_feed(result, &mut feed_fault, pid);
                    Step::Progress
                }
                text = &mut drain, if !drain.is_terminated() => {
                    summary = text;
                    Step::Progress
                }
                chunk = stdout.read_chunk() => match chunk {
                    Ok(Some(bytes)) => Step::Chunk(bytes),
                    Ok(None) => Step::StdoutDone,
                    Err(err) => Step::ReadFailed(err),
                },
            };

            match step {
                Step::Chunk(bytes) => yield Ok(bytes),
                Step::StdoutDone => break,
                Step::Progress => {}
                Step::Cancelled => {
                    if let Err(err) = handle.kill().await {
                        warn!(pid = %pid, error = %err, "Failed to kill cancelled process");
                    }
                    yield Err(ProcessError::Cancelled { command });
                    return;
                }
                Step::ReadFailed(err) => {
                    yield Err(ProcessError::Stream { command, cause: Box::new(err) });
                    return;
                }
                Step::Exited(_) | Step::WaitFailed(_) => {}
            }
        }
        debug!(pid = %pid, "Stdout exhausted, awaiting exit");

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                result = &mut feed, if !feed.is_terminated() => {
                    record_feed(result, &mut feed_fault, pid);
                    Step::Progress
                }
                text = &mut drain, if !drain.is_terminated() => {
                    summary = text;
                    Step::Progress
                }
                status = handle.wait() => match status {
                    Ok(outcome) => Step::Exited(outcome),
                    Err(err) => Step::WaitFailed(err),
                },
            };

            match step {
                Step::Exited(outcome) => break outcome,
                Step::WaitFailed(err) => {
                    yield Err(err);
                    return;
                }
                Step::Cancelled => {
                    if let Err(err) = handle.kill().await {
                        warn!(pid = %pid, error = %err, "Failed to kill cancelled process");
                    }
                    yield Err(ProcessError::Cancelled { command });
                    return;
                }
                _ => {}
            }
        };

        // The child is gone; input it never read is irrelevant now
        if !feed.is_terminated() {
            if let Some(result) = (&mut feed).now_or_never() {
                record_feed(result, &mut feed_fault, pid);
            }
        }
        drop(feed);
        if !drain.is_terminated() {
            summary = drain.await;
        }

        let failure = match (outcome.code, outcome.signal) {
            (Some(0), None) => feed_fault.map(|cause| ProcessError::Stream {
                command: command.clone(),
                cause,
            }),
            (_, Some(signal)) => Some(ProcessError::Signal {
                command: command.clone(),
                signal,
                stderr: None,
                cause: feed_fault,
            }),
            (code, None) => Some(ProcessError::ExitStatus {
                command: command.clone(),
                code: code.unwrap_or(-1),
                stderr: None,
                cause: feed_fault,
            }),
        };

        if let Some(failure) = failure {
            debug!(pid = %pid, error = %failure, "Process failed");
            if let Err(err) = handler(failure, summary) {
                yield Err(err);
            }
        }
    }
}
