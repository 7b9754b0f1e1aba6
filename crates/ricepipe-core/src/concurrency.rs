//! Bounded-concurrency mapping operators
//!
//! Both operators admit at most `limit` computations at a time and drive them from
//! the consumer's task; nothing is spawned. Each admitted computation is polled
//! independently, so a slow one never stalls the others.
//!
//! - [`ConcurrentMap`] yields results in source order, waiting on the oldest
//!   outstanding computation.
//! - [`ConcurrentUnorderedMap`] yields results as they settle and refills the freed
//!   slot on the next pull.
//!
//! The first failure, from the source or from a computation, is yielded and the
//! operator terminates. Dropping an operator cancels every computation still in
//! flight; their outcomes are discarded unobserved.

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{
    FusedStream, FuturesOrdered, FuturesUnordered, Stream, StreamExt, TryStream,
};
use tracing::trace;

use crate::error::ConcurrencyError;

/// Reported hardware parallelism, or 1 if it cannot be determined
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn validate(limit: usize) -> Result<usize, ConcurrencyError> {
    if limit == 0 {
        return Err(ConcurrencyError::InvalidLimit { limit });
    }
    Ok(limit)
}

/// Map `source` through `f` with at most `limit` computations in flight, in order
pub fn concurrent_map<S, F, Fut, T, U, E>(
    source: S,
    f: F,
    limit: usize,
) -> Result<ConcurrentMap<S, F, Fut>, ConcurrencyError>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    Ok(ConcurrentMap {
        admission: Admission::new(source, f, validate(limit)?),
        in_flight: FuturesOrdered::new(),
    })
}

/// Map `source` through `f` with at most `limit` computations in flight, yielding in
/// completion order
pub fn concurrent_unordered_map<S, F, Fut, T, U, E>(
    source: S,
    f: F,
    limit: usize,
) -> Result<ConcurrentUnorderedMap<S, F, Fut>, ConcurrencyError>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    Ok(ConcurrentUnorderedMap {
        admission: Admission::new(source, f, validate(limit)?),
        in_flight: FuturesUnordered::new(),
    })
}

/// Shared admission control: pulls from the source while the window has room
struct Admission<S, F, E> {
    source: Option<S>,
    f: F,
    limit: usize,
    /// Source failure held back until the computations admitted before it are yielded
    source_error: Option<E>,
    done: bool,
}

impl<S, F, E> Admission<S, F, E> {
    fn new(source: S, f: F, limit: usize) -> Self {
        Self {
            source: Some(source),
            f,
            limit,
            source_error: None,
            done: false,
        }
    }

    /// Fill the window from the source without blocking
    fn fill<T, Fut>(&mut self, cx: &mut Context<'_>, in_flight: &mut impl Window<Fut>)
    where
        S: Stream<Item = Result<T, E>> + Unpin,
        F: FnMut(T) -> Fut,
    {
        while in_flight.len() < self.limit {
            let Some(source) = self.source.as_mut() else {
                return;
            };

            match source.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(item))) => {
                    in_flight.admit((self.f)(item));
                    trace!(in_flight = in_flight.len(), limit = self.limit, "Admitted computation");
                }
                Poll::Ready(Some(Err(err))) => {
                    self.source = None;
                    self.source_error = Some(err);
                }
                Poll::Ready(None) => self.source = None,
                Poll::Pending => return,
            }
        }
    }

    /// Outcome once the window has drained
    fn drained<U>(&mut self) -> Poll<Option<Result<U, E>>> {
        if let Some(err) = self.source_error.take() {
            self.done = true;
            return Poll::Ready(Some(Err(err)));
        }
        if self.source.is_none() {
            self.done = true;
            return Poll::Ready(None);
        }
        // Source is pending and already holds our waker
        Poll::Pending
    }

    fn fail(&mut self) {
        self.done = true;
        self.source = None;
        self.source_error = None;
    }
}

/// In-flight set abstraction over ordered and unordered future queues
trait Window<Fut> {
    fn len(&self) -> usize;
    fn admit(&mut self, fut: Fut);
}

impl<Fut: Future> Window<Fut> for FuturesOrdered<Fut> {
    fn len(&self) -> usize {
        FuturesOrdered::len(self)
    }

    fn admit(&mut self, fut: Fut) {
        self.push_back(fut);
    }
}

impl<Fut: Future> Window<Fut> for FuturesUnordered<Fut> {
    fn len(&self) -> usize {
        FuturesUnordered::len(self)
    }

    fn admit(&mut self, fut: Fut) {
        self.push(fut);
    }
}

/// Order-preserving concurrent map, see [`concurrent_map`]
pub struct ConcurrentMap<S: TryStream, F, Fut: Future> {
    admission: Admission<S, F, S::Error>,
    in_flight: FuturesOrdered<Fut>,
}

/// Completion-order concurrent map, see [`concurrent_unordered_map`]
pub struct ConcurrentUnorderedMap<S: TryStream, F, Fut: Future> {
    admission: Admission<S, F, S::Error>,
    in_flight: FuturesUnordered<Fut>,
}

// Pinning is never structural: the queues box their futures and `S` is `Unpin`.
impl<S: TryStream + Unpin, F, Fut: Future> Unpin for ConcurrentMap<S, F, Fut> {}
impl<S: TryStream + Unpin, F, Fut: Future> Unpin for ConcurrentUnorderedMap<S, F, Fut> {}

macro_rules! impl_concurrent_stream {
    ($name:ident) => {
        impl<S, F, Fut, T, U, E> Stream for $name<S, F, Fut>
        where
            S: Stream<Item = Result<T, E>> + Unpin,
            F: FnMut(T) -> Fut,
            Fut: Future<Output = Result<U, E>>,
        {
            type Item = Result<U, E>;

            fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
                let this = self.get_mut();
                if this.admission.done {
                    return Poll::Ready(None);
                }

                this.admission.fill(cx, &mut this.in_flight);

                match this.in_flight.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(Ok(value))),
                    Poll::Ready(Some(Err(err))) => {
                        this.admission.fail();
                        // Cancel everything still running
                        this.in_flight.clear();
                        Poll::Ready(Some(Err(err)))
                    }
                    Poll::Ready(None) => this.admission.drained(),
                    Poll::Pending => Poll::Pending,
                }
            }

            fn size_hint(&self) -> (usize, Option<usize>) {
                if self.admission.done {
                    return (0, Some(0));
                }
                let in_flight = self.in_flight.len();
                match &self.admission.source {
                    Some(source) => {
                        let (low, high) = source.size_hint();
                        (
                            low.saturating_add(in_flight),
                            high.and_then(|h| h.checked_add(in_flight + 1)),
                        )
                    }
                    None => (0, Some(in_flight + 1)),
                }
            }
        }

        impl<S, F, Fut, T, U, E> FusedStream for $name<S, F, Fut>
        where
            S: Stream<Item = Result<T, E>> + Unpin,
            F: FnMut(T) -> Fut,
            Fut: Future<Output = Result<U, E>>,
        {
            fn is_terminated(&self) -> bool {
                self.admission.done
            }
        }
    };
}

impl_concurrent_stream!(ConcurrentMap);
impl_concurrent_stream!(ConcurrentUnorderedMap);

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream;
    use proptest::prelude::*;
    use tokio::time::sleep;

    use super::*;

    /// Records how many computations run at once
    #[derive(Clone, Default)]
    struct Gate {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Gate {
        async fn run<T>(&self, delay_ms: u64, value: T) -> T {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            value
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn source<T>(items: Vec<T>) -> impl Stream<Item = Result<T, String>> + Unpin {
        stream::iter(items.into_iter().map(Ok))
    }

    #[test]
    fn test_zero_limit_rejected() {
        let result = concurrent_map(source(vec![1]), |n: i32| async move { Ok(n) }, 0);
        assert_eq!(
            result.err(),
            Some(ConcurrencyError::InvalidLimit { limit: 0 })
        );
        let result = concurrent_unordered_map(source(vec![1]), |n: i32| async move { Ok(n) }, 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_concurrency_positive() {
        assert!(default_concurrency() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_vs_unordered_by_delay() {
        let delays = vec![("A", 100), ("B", 1), ("C", 50)];

        let ordered: Vec<_> = concurrent_map(
            source(delays.clone()),
            |(name, ms)| async move {
                sleep(Duration::from_millis(ms)).await;
                Ok(name)
            },
            3,
        )
        .unwrap()
        .collect()
        .await;
        assert_eq!(ordered, vec![Ok("A"), Ok("B"), Ok("C")]);

        let unordered: Vec<_> = concurrent_unordered_map(
            source(delays),
            |(name, ms)| async move {
                sleep(Duration::from_millis(ms)).await;
                Ok(name)
            },
            3,
        )
        .unwrap()
        .collect()
        .await;
        assert_eq!(unordered, vec![Ok("B"), Ok("C"), Ok("A")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limits_peak_concurrency() {
        let gate = Gate::default();
        let g = gate.clone();
        let results: Vec<_> = concurrent_unordered_map(
            source((0..20u64).collect()),
            move |n| {
                let g = g.clone();
                async move { Ok(g.run(n % 7 + 1, n).await) }
            },
            3,
        )
        .unwrap()
        .collect()
        .await;

        assert_eq!(results.len(), 20);
        assert_eq!(gate.peak(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_computation_failure_terminates_stream() {
        let results: Vec<_> = concurrent_map(
            source(vec![1, 2, 3, 4]),
            |n| async move {
                sleep(Duration::from_millis(10)).await;
                if n == 2 {
                    Err(format!("bad {n}"))
                } else {
                    Ok(n)
                }
            },
            2,
        )
        .unwrap()
        .collect()
        .await;

        assert_eq!(results, vec![Ok(1), Err("bad 2".to_string())]);
    }

    #[tokio::test]
    async fn test_source_failure_after_admitted_results() {
        let items = stream::iter(vec![Ok(1), Ok(2), Err("source broke".to_string()), Ok(4)]);
        let results: Vec<_> = concurrent_map(items, |n| async move { Ok(n * 10) }, 4)
            .unwrap()
            .collect()
            .await;

        assert_eq!(
            results,
            vec![Ok(10), Ok(20), Err("source broke".to_string())]
        );
    }

    /// Flags whether a computation was dropped before finishing
    struct DropFlag(Arc<AtomicBool>, bool);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            if !self.1 {
                self.0.store(true, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_failures_are_cancelled_not_surfaced() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let mut mapped = concurrent_unordered_map(
            source(vec![1u64, 500]),
            move |ms| {
                let flag = flag.clone();
                async move {
                    let mut guard = DropFlag(flag, false);
                    sleep(Duration::from_millis(ms)).await;
                    guard.1 = true;
                    if ms == 500 {
                        Err("late failure".to_string())
                    } else {
                        Ok(ms)
                    }
                }
            },
            2,
        )
        .unwrap();

        assert_eq!(mapped.next().await, Some(Ok(1)));
        // Consumer walks away while the failing computation is still pending
        drop(mapped);

        sleep(Duration::from_millis(1000)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_ordered_matches_sequential_map(
            delays in prop::collection::vec(0u64..20, 0..30),
            limit in 1usize..6,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let gate = Gate::default();
            let g = gate.clone();
            let input = delays.clone();
            let observed: Vec<_> = runtime.block_on(async move {
                concurrent_map(
                    source(input.into_iter().enumerate().collect()),
                    move |(idx, ms)| {
                        let g = g.clone();
                        async move { Ok(g.run(ms, idx * 2).await) }
                    },
                    limit,
                )
                .unwrap()
                .collect()
                .await
            });

            let expected: Vec<Result<usize, String>> =
                (0..delays.len()).map(|idx| Ok(idx * 2)).collect();
            prop_assert_eq!(observed, expected);
            prop_assert!(gate.peak() <= limit);
        }

        #[test]
        fn prop_unordered_yields_same_multiset(
            delays in prop::collection::vec(0u64..20, 0..30),
            limit in 1usize..6,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let gate = Gate::default();
            let g = gate.clone();
            let input = delays.clone();
            let mut observed: Vec<usize> = runtime.block_on(async move {
                concurrent_unordered_map(
                    source(input.into_iter().enumerate().collect()),
                    move |(idx, ms)| {
                        let g = g.clone();
                        async move { Ok(g.run(ms, idx).await) }
                    },
                    limit,
                )
                .unwrap()
                .map(|r: Result<usize, String>| r.unwrap())
                .collect()
                .await
            });

            observed.sort_unstable();
            prop_assert_eq!(observed, (0..delays.len()).collect::<Vec<_>>());
            prop_assert!(gate.peak() <= limit);
        }
    }
}
