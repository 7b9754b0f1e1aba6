//! Streaming byte-to-line scanner
//!
//! Lines are delimited by a single `\n`. A `\r` immediately before the delimiter is
//! stripped; nothing else is normalized. Bytes of an unfinished line are kept as
//! slices of the chunks they arrived in and concatenated once, when the line completes.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::stream::{FusedStream, Stream, StreamExt, TryStream};

const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// Incremental line splitter
#[derive(Debug, Default)]
pub struct LineScanner {
    /// Pieces of the current unterminated line, oldest first
    partial: Vec<Bytes>,
}

impl LineScanner {
    /// Create an empty scanner
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the raw lines it completed
    pub fn push_bytes(&mut self, chunk: Bytes) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut start = 0;

        for (idx, byte) in chunk.iter().enumerate() {
            if *byte == LF {
                let line = self.complete(&chunk[start..idx]);
                lines.push(line);
                start = idx + 1;
            }
        }

        if start < chunk.len() {
            self.partial.push(chunk.slice(start..));
        }

        lines
    }

    /// Feed one chunk and return the decoded lines it completed
    pub fn push(&mut self, chunk: Bytes) -> Vec<String> {
        self.push_bytes(chunk).into_iter().map(decode).collect()
    }

    /// Take the unterminated remainder, if any bytes are pending
    pub fn finish_bytes(&mut self) -> Option<Vec<u8>> {
        if self.partial.is_empty() {
            return None;
        }
        Some(self.concat(&[]))
    }

    /// Take the unterminated remainder as text
    pub fn finish(&mut self) -> Option<String> {
        self.finish_bytes().map(decode)
    }

    /// Whether bytes of an unfinished line are buffered
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    fn complete(&mut self, tail: &[u8]) -> Vec<u8> {
        let mut line = self.concat(tail);
        if line.last() == Some(&CR) {
            line.pop();
        }
        line
    }

    fn concat(&mut self, tail: &[u8]) -> Vec<u8> {
        let total = self.partial.iter().map(Bytes::len).sum::<usize>() + tail.len();
        let mut line = Vec::with_capacity(total);
        for piece in self.partial.drain(..) {
            line.extend_from_slice(&piece);
        }
        line.extend_from_slice(tail);
        line
    }
}

/// Invalid UTF-8 is replaced rather than rejected.
fn decode(line: Vec<u8>) -> String {
    match String::from_utf8(line) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}

/// How a completed line is represented
pub trait LineKind {
    type Line;

    fn convert(raw: Vec<u8>) -> Self::Line;
}

/// Lines decoded to `String`
#[derive(Debug)]
pub struct TextLine;

/// Lines kept as raw bytes
#[derive(Debug)]
pub struct RawLine;

impl LineKind for TextLine {
    type Line = String;

    fn convert(raw: Vec<u8>) -> String {
        decode(raw)
    }
}

impl LineKind for RawLine {
    type Line = Vec<u8>;

    fn convert(raw: Vec<u8>) -> Vec<u8> {
        raw
    }
}

/// Stream of line batches, one batch per chunk that completed at least one line
///
/// When the source fails, the pending remainder is flushed as a final batch before
/// the error is yielded, so no output already received is lost.
pub struct LineBatches<S: TryStream, K = TextLine> {
    source: Option<S>,
    scanner: LineScanner,
    deferred_error: Option<S::Error>,
    _kind: PhantomData<fn() -> K>,
}

/// Raw byte-line variant of [`LineBatches`]
pub type ByteLines<S> = LineBatches<S, RawLine>;

impl<S: TryStream, K> LineBatches<S, K> {
    /// Wrap a stream of byte chunks
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            scanner: LineScanner::new(),
            deferred_error: None,
            _kind: PhantomData,
        }
    }
}

impl<S: TryStream, K> Unpin for LineBatches<S, K> where S: Unpin {}

impl<S, E, K> Stream for LineBatches<S, K>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    K: LineKind,
{
    type Item = Result<Vec<K::Line>, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(err) = this.deferred_error.take() {
            return Poll::Ready(Some(Err(err)));
        }

        loop {
            let Some(source) = this.source.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(source.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let lines = this.scanner.push_bytes(chunk);
                    if !lines.is_empty() {
                        return Poll::Ready(Some(Ok(lines.into_iter().map(K::convert).collect())));
                    }
                }
                Some(Err(err)) => {
                    this.source = None;
                    return match this.scanner.finish_bytes() {
                        Some(rest) => {
                            this.deferred_error = Some(err);
                            Poll::Ready(Some(Ok(vec![K::convert(rest)])))
                        }
                        None => Poll::Ready(Some(Err(err))),
                    };
                }
                None => {
                    this.source = None;
                    return Poll::Ready(
                        this.scanner
                            .finish_bytes()
                            .map(|rest| Ok(vec![K::convert(rest)])),
                    );
                }
            }
        }
    }
}

impl<S, E, K> FusedStream for LineBatches<S, K>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    K: LineKind,
{
    fn is_terminated(&self) -> bool {
        self.source.is_none() && self.deferred_error.is_none()
    }
}
