//! Idempotent-close wrappers around process stream handles
//!
//! A [`Guarded`] owns one raw handle. Closing it (explicitly or by drop) releases
//! the handle exactly once; later closes are no-ops and later reads or writes fail
//! with [`ProcessError::StreamClosed`].

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use crate::error::{ProcessError, Result, StreamRole};

/// Read size for stdout/stderr chunks
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Per-stream release counters shared by a process handle and its stream wrappers
#[derive(Debug, Clone, Default)]
pub struct ReleaseCounts {
    counts: Arc<[AtomicUsize; 3]>,
}

impl ReleaseCounts {
    fn record(&self, role: StreamRole) {
        self.counts[role.index()].fetch_add(1, Ordering::SeqCst);
    }

    /// How many times the stream for `role` has been released
    pub fn get(&self, role: StreamRole) -> usize {
        self.counts[role.index()].load(Ordering::SeqCst)
    }
}

/// Once-only owner of a raw stream handle
#[derive(Debug)]
pub struct Guarded<R> {
    role: StreamRole,
    pid: u32,
    inner: Option<R>,
    releases: ReleaseCounts,
}

/// Guarded write end of a child's stdin
pub type StdinWriter = Guarded<ChildStdin>;
/// Guarded read end of a child's stdout
pub type StdoutReader = Guarded<ChildStdout>;
/// Guarded read end of a child's stderr
pub type StderrReader = Guarded<ChildStderr>;

impl<R> Guarded<R> {
    pub(crate) fn new(role: StreamRole, pid: u32, inner: R, releases: ReleaseCounts) -> Self {
        Self {
            role,
            pid,
            inner: Some(inner),
            releases,
        }
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Borrow the raw handle, failing once closed
    pub fn get_mut(&mut self) -> Result<&mut R> {
        self.inner
            .as_mut()
            .ok_or(ProcessError::StreamClosed { role: self.role })
    }

    /// Release the raw handle; only the first call does anything
    pub fn close(&mut self) {
        drop(self.release());
    }

    fn release(&mut self) -> Option<R> {
        let inner = self.inner.take()?;
        self.releases.record(self.role);
        debug!(pid = %self.pid, role = %self.role, "Stream released");
        Some(inner)
    }

    fn io_error(&self, source: io::Error) -> ProcessError {
        ProcessError::Io {
            role: self.role,
            source,
        }
    }
}

impl<R> Drop for Guarded<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: AsyncRead + Unpin> Guarded<R> {
    /// Read the next chunk; `None` at end of stream, which also closes the wrapper
    ///
    /// Cancel safe: dropping the future before completion loses no data.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        loop {
            let reader = self.get_mut()?;
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    self.close();
                    return Ok(None);
                }
                Ok(_) => return Ok(Some(buf.freeze())),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.io_error(err)),
            }
        }
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> Guarded<R> {
    /// Turn the reader into a chunk stream that owns it
    pub fn into_chunks(self) -> BoxStream<'static, Result<Bytes>> {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

impl<W: AsyncWrite + Unpin> Guarded<W> {
    /// Write the whole buffer
    ///
    /// A reader that went away surfaces as an `Io` error for which
    /// [`ProcessError::is_broken_pipe`] holds.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.get_mut()?;
        match writer.write_all(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Flush, shut down and release the writer
    ///
    /// Idempotent. Broken-pipe and interrupted conditions mean the reader is already
    /// gone and are swallowed; other failures are reported after the handle is
    /// released.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(mut writer) = self.release() else {
            return Ok(());
        };

        let result = match writer.flush().await {
            Ok(()) => writer.shutdown().await,
            Err(err) => Err(err),
        };
        drop(writer);

        match result {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted
                ) =>
            {
                warn!(pid = %self.pid, role = %self.role, error = %err, "Ignoring close error on exhausted writer");
                Ok(())
            }
            Err(err) => Err(self.io_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guarded_duplex() -> (Guarded<tokio::io::DuplexStream>, tokio::io::DuplexStream, ReleaseCounts) {
        let releases = ReleaseCounts::default();
        let (a, b) = tokio::io::duplex(64);
        (Guarded::new(StreamRole::Stdin, 1, a, releases.clone()), b, releases)
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_counted_once() {
        let (mut guarded, _peer, releases) = guarded_duplex();
        guarded.close();
        guarded.close();
        assert!(guarded.shutdown().await.is_ok());
        drop(guarded);
        assert_eq!(releases.get(StreamRole::Stdin), 1);
    }

    #[tokio::test]
    async fn test_use_after_close_fails_loudly() {
        let (mut guarded, _peer, _) = guarded_duplex();
        guarded.close();
        assert!(matches!(
            guarded.write_all(b"x").await,
            Err(ProcessError::StreamClosed {
                role: StreamRole::Stdin
            })
        ));
        assert!(matches!(
            guarded.read_chunk().await,
            Err(ProcessError::StreamClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_until_eof_releases_reader() {
        let releases = ReleaseCounts::default();
        let (mut writer, reader) = tokio::io::duplex(64);
        let guarded = Guarded::new(StreamRole::Stdout, 1, reader, releases.clone());

        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        let chunks: Vec<_> = guarded.into_chunks().collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &Bytes::from_static(b"hello"));
        assert_eq!(releases.get(StreamRole::Stdout), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_once() {
        let (guarded, _peer, releases) = guarded_duplex();
        drop(guarded);
        assert_eq!(releases.get(StreamRole::Stdin), 1);
    }
}
