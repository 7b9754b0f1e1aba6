//! Fluent pipeline over a fallible async sequence
//!
//! A [`Pipeline`] is a boxed stream of `Result<T, PipelineError>`. Operators wrap the
//! stream and return a new pipeline; nothing runs until the pipeline is consumed by a
//! terminal call (`collect`, `reduce`, `for_each`) or polled as a [`Stream`].
//! `run` spawns a process whose stdin is fed from the pipeline and whose stdout
//! becomes the next pipeline.
//!
//! Every pipeline ends at its first failure: the error is the last item a consumer
//! sees, whichever operator produced it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::{self, BoxStream, FusedStream, Stream, StreamExt, TryStreamExt};
use ricepipe_core::{ByteLines, ChannelReader, LineBatches, TextLine};
use ricepipe_process::ProcessSpec;

use crate::bindings::{StreamInput, StreamOutput};
use crate::error::{PipelineError, Result};
use crate::exec::{Execution, RunOptions};
use crate::handlers::StdinItem;
use crate::{tee, zip};

/// Ends after the first failure without polling the source again
///
/// Dropping the source at that point also releases whatever it holds, such as a
/// process's pipes.
struct UntilFailure<T> {
    source: Option<BoxStream<'static, Result<T>>>,
}

impl<T> Stream for UntilFailure<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(source) = self.source.as_mut() else {
            return Poll::Ready(None);
        };
        let item = ready!(source.poll_next_unpin(cx));
        if !matches!(item, Some(Ok(_))) {
            self.source = None;
        }
        Poll::Ready(item)
    }
}

impl<T> FusedStream for UntilFailure<T> {
    fn is_terminated(&self) -> bool {
        self.source.is_none()
    }
}

/// Chainable, lazily evaluated sequence of `T`
pub struct Pipeline<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Pipeline<T> {
    fn wrap(inner: BoxStream<'static, Result<T>>) -> Self {
        Self {
            inner: UntilFailure {
                source: Some(inner),
            }
            .boxed(),
        }
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_try_stream(stream::iter(items.into_iter().map(Ok::<T, PipelineError>)))
    }

    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::wrap(source.map(Ok).boxed())
    }

    pub fn from_try_stream<S, E>(source: S) -> Self
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        E: Into<PipelineError> + 'static,
    {
        Self::wrap(source.map_err(Into::<PipelineError>::into).boxed())
    }

    /// Pipeline over the items written to a channel's writer half
    pub fn from_channel<E>(reader: ChannelReader<T, E>) -> Self
    where
        E: Into<PipelineError> + Send + 'static,
    {
        Self::from_try_stream(reader)
    }

    pub fn empty() -> Self {
        Self::wrap(stream::empty().boxed())
    }

    pub fn once(item: T) -> Self {
        Self::wrap(stream::once(future::ready(Ok(item))).boxed())
    }

    /// Pipeline built by `setup` when first polled
    pub fn defer<Fut>(setup: Fut) -> Self
    where
        Fut: Future<Output = Result<Pipeline<T>>> + Send + 'static,
    {
        Self::wrap(stream::once(setup).try_flatten().boxed())
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        self.inner
    }

    pub fn map<U, F>(self, f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Pipeline::wrap(self.inner.map_ok(f).boxed())
    }

    /// Map with a fallible closure; the first failure ends the pipeline
    pub fn try_map<U, E, F>(self, mut f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        E: Into<PipelineError> + 'static,
        F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
    {
        Pipeline::wrap(
            self.inner
                .and_then(move |item| future::ready(f(item).map_err(Into::<PipelineError>::into)))
                .boxed(),
        )
    }

    pub fn filter<F>(self, mut predicate: F) -> Pipeline<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        Pipeline::wrap(
            self.inner
                .try_filter(move |item| future::ready(predicate(item)))
                .boxed(),
        )
    }

    /// Replace every item with the items of an iterator, in order
    pub fn flat_map<U, I, F>(self, mut f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: FnMut(T) -> I + Send + 'static,
    {
        Pipeline::wrap(
            self.inner
                .map_ok(move |item| stream::iter(f(item).into_iter().map(Ok::<U, PipelineError>)))
                .try_flatten()
                .boxed(),
        )
    }

    /// Replace every item with a whole pipeline, consumed one after another
    pub fn flat_map_pipeline<U, F>(self, f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Pipeline<U> + Send + 'static,
    {
        Pipeline::wrap(self.inner.map_ok(f).try_flatten().boxed())
    }

    /// Map through an async computation with at most `limit` in flight, keeping order
    pub fn concurrent_map<U, E, Fut, F>(self, mut f: F, limit: usize) -> Result<Pipeline<U>>
    where
        U: Send + 'static,
        E: Into<PipelineError> + 'static,
        Fut: Future<Output = std::result::Result<U, E>> + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
    {
        let op = ricepipe_core::concurrent_map(
            self.inner,
            move |item| {
                let computation = f(item);
                async move { computation.await.map_err(Into::<PipelineError>::into) }
            },
            limit,
        )?;
        Ok(Pipeline::wrap(op.boxed()))
    }

    /// Like [`concurrent_map`](Self::concurrent_map), yielding in completion order
    pub fn concurrent_unordered_map<U, E, Fut, F>(
        self,
        mut f: F,
        limit: usize,
    ) -> Result<Pipeline<U>>
    where
        U: Send + 'static,
        E: Into<PipelineError> + 'static,
        Fut: Future<Output = std::result::Result<U, E>> + Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
    {
        let op = ricepipe_core::concurrent_unordered_map(
            self.inner,
            move |item| {
                let computation = f(item);
                async move { computation.await.map_err(Into::<PipelineError>::into) }
            },
            limit,
        )?;
        Ok(Pipeline::wrap(op.boxed()))
    }

    /// First `n` items
    pub fn take(self, n: usize) -> Pipeline<T> {
        Pipeline::wrap(self.inner.take(n).boxed())
    }

    /// All but the first `n` items
    pub fn skip(self, n: usize) -> Pipeline<T> {
        let mut remaining = n;
        Pipeline::wrap(
            self.inner
                .try_filter(move |_| {
                    let keep = remaining == 0;
                    remaining = remaining.saturating_sub(1);
                    future::ready(keep)
                })
                .boxed(),
        )
    }

    /// Pair items up; stops at the shorter side and drains the longer one
    pub fn zip<U: Send + 'static>(self, other: Pipeline<U>) -> Pipeline<(T, U)> {
        Pipeline::wrap(zip::zip(self.inner, other.inner))
    }

    /// Items of `self`, then items of `other`
    ///
    /// A failure in `self` ends the pipeline; `other` is then never polled.
    pub fn concat(self, other: Pipeline<T>) -> Pipeline<T> {
        Pipeline::wrap(self.inner.chain(other.inner).boxed())
    }

    pub async fn reduce<A, F>(self, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        let mut acc = init;
        let mut inner = self.inner;
        while let Some(item) = inner.next().await {
            acc = f(acc, item?);
        }
        Ok(acc)
    }

    pub async fn for_each<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(T),
    {
        let mut inner = self.inner;
        while let Some(item) = inner.next().await {
            f(item?);
        }
        Ok(())
    }

    /// Every item, or the first failure
    pub async fn collect(self) -> Result<Vec<T>> {
        self.inner.try_collect().await
    }
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    /// `n` independent pipelines over one shared, buffered source
    ///
    /// Items are kept until every live branch has consumed them, so memory grows with
    /// the lag of the slowest branch.
    pub fn tee(self, n: usize) -> Vec<Pipeline<T>> {
        tee::tee(self.inner, n)
            .into_iter()
            .map(|branch| Pipeline::wrap(branch.boxed()))
            .collect()
    }
}

impl<A, B> Pipeline<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    /// Split a pipeline of pairs into two pipelines
    pub fn unzip(self) -> (Pipeline<A>, Pipeline<B>) {
        let mut branches = self.tee(2).into_iter();
        match (branches.next(), branches.next()) {
            (Some(left), Some(right)) => (left.map(|(a, _)| a), right.map(|(_, b)| b)),
            _ => (Pipeline::empty(), Pipeline::empty()),
        }
    }
}

impl<T: StdinItem> Pipeline<T> {
    /// Feed the items as newline-terminated lines into `spec`'s stdin and stream its
    /// stdout
    ///
    /// The process is spawned when the returned pipeline is first polled.
    pub fn run(self, spec: ProcessSpec) -> Pipeline<Bytes> {
        self.run_with(spec, RunOptions::default())
    }

    /// [`run`](Self::run), then split stdout into text lines
    pub fn run_lines(self, spec: ProcessSpec) -> Pipeline<String> {
        self.run(spec).lines()
    }

    pub fn run_with(self, spec: ProcessSpec, options: RunOptions) -> Pipeline<Bytes> {
        Pipeline::defer(async move {
            let RunOptions {
                encoding,
                stderr,
                cancel,
            } = options;
            let mut execution = Execution::new(spec).stderr(stderr);
            if let Some(token) = cancel {
                execution = execution.cancel(token);
            }
            execution
                .execute(StreamInput::new(encoding), self, &StreamOutput)
                .await
        })
    }
}

impl Pipeline<Bytes> {
    /// Text lines, split across chunk boundaries
    pub fn lines(self) -> Pipeline<String> {
        Pipeline::wrap(
            LineBatches::<_, TextLine>::new(self.inner)
                .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<String, PipelineError>)))
                .try_flatten()
                .boxed(),
        )
    }

    /// Raw byte lines, split across chunk boundaries
    pub fn byte_lines(self) -> Pipeline<Vec<u8>> {
        Pipeline::wrap(
            ByteLines::new(self.inner)
                .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<Vec<u8>, PipelineError>)))
                .try_flatten()
                .boxed(),
        )
    }

    /// All bytes concatenated
    pub async fn bytes(self) -> Result<Bytes> {
        let buf = self
            .inner
            .try_fold(BytesMut::new(), |mut buf, chunk| {
                buf.extend_from_slice(&chunk);
                future::ready(Ok(buf))
            })
            .await?;
        Ok(buf.freeze())
    }

    /// All bytes decoded as UTF-8, replacing invalid sequences
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<T> Stream for Pipeline<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T: Send + 'static> From<Vec<T>> for Pipeline<T> {
    fn from(items: Vec<T>) -> Self {
        Pipeline::from_iter(items)
    }
}

impl<T: Send + 'static> FromIterator<T> for Pipeline<T> {
    fn from_iter<I: IntoIterator<Item = T>>(items: I) -> Self {
        let items: Vec<T> = items.into_iter().collect();
        Pipeline::from(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn numbers(n: u32) -> Pipeline<u32> {
        Pipeline::from_iter(0..n)
    }

    #[tokio::test]
    async fn test_map_filter_collect() {
        let out = numbers(10)
            .map(|n| n * 2)
            .filter(|n| n % 3 == 0)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![0, 6, 12, 18]);
    }

    #[tokio::test]
    async fn test_substring_filter() {
        let out = Pipeline::from_iter(["a", "b", "bc", "d"])
            .filter(|s| s.contains('b'))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec!["b", "bc"]);
    }

    #[tokio::test]
    async fn test_concat_ends_at_failure_in_first() {
        let first = Pipeline::from_try_stream(stream::iter([
            Ok(1),
            Err(PipelineError::msg("first failed")),
        ]));
        let mut joined = first.concat(Pipeline::from_iter([7, 8]));

        assert_eq!(joined.next().await.unwrap().unwrap(), 1);
        assert_eq!(
            joined.next().await.unwrap().unwrap_err().to_string(),
            "first failed"
        );
        assert!(joined.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_last_item_through_operators() {
        let items: Vec<_> = numbers(4)
            .try_map(|n| {
                if n == 1 {
                    Err(PipelineError::msg("bad"))
                } else {
                    Ok(n)
                }
            })
            .map(|n| n * 10)
            .filter(|_| true)
            .into_stream()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), 0);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_source_not_polled_after_failure() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream::iter(0..4).map(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                Err(PipelineError::msg("bad"))
            } else {
                Ok(n)
            }
        });

        let mut pipeline = Pipeline::from_try_stream(source);
        while pipeline.next().await.is_some() {}
        assert!(pipeline.next().await.is_none());
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_try_map_stops_at_first_failure() {
        let mut pipeline = numbers(5).try_map(|n| {
            if n == 2 {
                Err(PipelineError::msg("two"))
            } else {
                Ok(n)
            }
        });
        assert_eq!(pipeline.next().await.unwrap().unwrap(), 0);
        assert_eq!(pipeline.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            pipeline.next().await,
            Some(Err(PipelineError::Message(_)))
        ));
        assert!(pipeline.next().await.is_none());
    }

    #[tokio::test]
    async fn test_flat_map_and_flat_map_pipeline() {
        let out = numbers(3).flat_map(|n| vec![n; n as usize]).collect().await.unwrap();
        assert_eq!(out, vec![1, 2, 2]);

        let out = numbers(3)
            .flat_map_pipeline(|n| Pipeline::from_iter([n, n + 10]))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![0, 10, 1, 11, 2, 12]);
    }

    #[tokio::test]
    async fn test_take_skip_concat() {
        let out = numbers(10).skip(3).take(4).collect().await.unwrap();
        assert_eq!(out, vec![3, 4, 5, 6]);

        let out = numbers(2).concat(Pipeline::once(9)).collect().await.unwrap();
        assert_eq!(out, vec![0, 1, 9]);

        assert!(Pipeline::<u32>::empty().collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reduce_and_for_each() {
        assert_eq!(numbers(5).reduce(0, |acc, n| acc + n).await.unwrap(), 10);

        let mut seen = Vec::new();
        numbers(3).for_each(|n| seen.push(n)).await.unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_reduce_propagates_failure() {
        let failing = numbers(3).concat(Pipeline::from_try_stream(stream::once(async {
            Err::<u32, _>(PipelineError::msg("late"))
        })));
        let err = failing.reduce(0, |acc, n| acc + n).await.unwrap_err();
        assert_eq!(err.to_string(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_map_preserves_order() {
        let delays = [("A", 100), ("B", 1), ("C", 50)];
        let slow = |(name, ms): (&'static str, u64)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, PipelineError>(name)
        };

        let ordered = Pipeline::from_iter(delays)
            .concurrent_map(slow, 3)
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(ordered, vec!["A", "B", "C"]);

        let unordered = Pipeline::from_iter(delays)
            .concurrent_unordered_map(slow, 3)
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(unordered, vec!["B", "C", "A"]);
    }

    #[tokio::test]
    async fn test_concurrent_map_rejects_zero_limit() {
        let result = numbers(3).concurrent_map(|n| async move { Ok::<_, PipelineError>(n) }, 0);
        assert!(matches!(result, Err(PipelineError::Concurrency(_))));
    }

    #[tokio::test]
    async fn test_lines_across_chunks() {
        let chunks = ["al", "pha\nbe", "ta\r\n", "gamma"].map(|part| Bytes::from_static(part.as_bytes()));
        let lines = Pipeline::from_iter(chunks).lines().collect().await.unwrap();
        assert_eq!(lines, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn test_text_and_byte_lines() {
        let chunks = || Pipeline::from_iter([Bytes::from_static(b"x\n"), Bytes::from_static(b"y")]);
        assert_eq!(chunks().text().await.unwrap(), "x\ny");
        assert_eq!(
            chunks().byte_lines().collect().await.unwrap(),
            vec![b"x".to_vec(), b"y".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_defer_runs_setup_lazily() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pipeline = Pipeline::defer(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Pipeline::from_iter([1, 2]))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.collect().await.unwrap(), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unzip() {
        let (left, right) = Pipeline::from_iter([(1, 'a'), (2, 'b')]).unzip();
        assert_eq!(left.collect().await.unwrap(), vec![1, 2]);
        assert_eq!(right.collect().await.unwrap(), vec!['a', 'b']);
    }
}
