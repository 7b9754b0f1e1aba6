//! Pairwise zip that never leaves a partner half-consumed

use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use tracing::trace;

use crate::error::Result;

/// Drain the rest of `side`, surfacing its first failure
async fn drain<T>(side: &mut BoxStream<'static, Result<T>>) -> Result<usize> {
    let mut dropped = 0;
    while let Some(item) = side.next().await {
        item?;
        dropped += 1;
    }
    Ok(dropped)
}

/// Pair items from both sides until one ends, then run the other to completion
///
/// Draining matters when the longer side is a process: reading its output to the end
/// lets it exit normally and reports its exit status.
pub(crate) fn zip<T, U>(
    mut left: BoxStream<'static, Result<T>>,
    mut right: BoxStream<'static, Result<U>>,
) -> BoxStream<'static, Result<(T, U)>>
where
    T: Send + 'static,
    U: Send + 'static,
{
    stream! {
        loop {
            let a = match left.next().await {
                Some(Ok(a)) => a,
                Some(Err(err)) => {
                    yield Err(err);
                    break;
                }
                None => {
                    match drain(&mut right).await {
                        Ok(dropped) => trace!(dropped, "Drained right side of zip"),
                        Err(err) => yield Err(err),
                    }
                    break;
                }
            };

            match right.next().await {
                Some(Ok(b)) => yield Ok((a, b)),
                Some(Err(err)) => {
                    yield Err(err);
                    break;
                }
                None => {
                    // `a` has no partner; it counts toward the drained rest
                    match drain(&mut left).await {
                        Ok(dropped) => trace!(dropped = dropped + 1, "Drained left side of zip"),
                        Err(err) => yield Err(err),
                    }
                    break;
                }
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::stream;

    use super::*;
    use crate::error::PipelineError;

    fn counted(n: usize, pulled: Arc<AtomicUsize>) -> BoxStream<'static, Result<usize>> {
        stream::iter(0..n)
            .map(move |i| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            })
            .boxed()
    }

    #[tokio::test]
    async fn test_truncates_and_drains_longer_right() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let left = counted(2, Arc::new(AtomicUsize::new(0)));
        let right = counted(5, pulled.clone());

        let pairs: Vec<_> = zip(left, right).collect().await;
        let pairs: Vec<(usize, usize)> = pairs.into_iter().map(|p| p.unwrap()).collect();
        assert_eq!(pairs, vec![(0, 0), (1, 1)]);
        assert_eq!(pulled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_truncates_and_drains_longer_left() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let left = counted(4, pulled.clone());
        let right = counted(1, Arc::new(AtomicUsize::new(0)));

        let pairs: Vec<_> = zip(left, right).collect().await;
        assert_eq!(pairs.len(), 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_while_draining_is_reported() {
        let left = counted(1, Arc::new(AtomicUsize::new(0)));
        let right = stream::iter(vec![Ok(0), Ok(1), Err(PipelineError::msg("late"))]).boxed();

        let items: Vec<_> = zip(left, right).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "late");
    }
}
