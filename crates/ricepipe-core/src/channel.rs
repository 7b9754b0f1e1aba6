//! Push/pull bridge with one-slot backpressure
//!
//! ```text
//!   ChannelWriter ──write──▶ [ 1 slot ] ──▶ ChannelReader (Stream)
//!                  ├── write waits while the slot is occupied
//!                  ├── close(None)  → reader completes after the last item
//!                  ├── close(Some)  → reader yields the error after the last item
//!                  └── write after close → ChannelError::WriteAfterClose
//! ```
//!
//! Built on a capacity-one `tokio::sync::mpsc` channel carrying `Result<T, E>`;
//! the error variant doubles as the close sentinel.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::stream::{FusedStream, Stream};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::ChannelError;

/// Create a connected writer/reader pair
pub fn channel<T, E>() -> (ChannelWriter<T, E>, ChannelReader<T, E>) {
    let (tx, rx) = mpsc::channel(1);
    (
        ChannelWriter { tx: Some(tx) },
        ChannelReader {
            rx,
            finished: false,
        },
    )
}

/// Producing half of a channel
#[derive(Debug)]
pub struct ChannelWriter<T, E> {
    /// `None` once closed
    tx: Option<mpsc::Sender<Result<T, E>>>,
}

impl<T, E> ChannelWriter<T, E> {
    /// Queue an item, waiting while the single slot is occupied
    ///
    /// Fails with [`ChannelError::WriteAfterClose`] once [`close`](Self::close) was
    /// called, and with [`ChannelError::ReceiverDropped`] if the reader is gone.
    pub async fn write(&mut self, item: T) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::WriteAfterClose)?;
        tx.send(Ok(item))
            .await
            .map_err(|_| ChannelError::ReceiverDropped)
    }

    /// Close the channel, optionally with a terminal error
    ///
    /// Only the first call has an effect. When the reader was already dropped the
    /// error has nowhere to go and is discarded.
    pub async fn close(&mut self, error: Option<E>) {
        let Some(tx) = self.tx.take() else {
            trace!("Channel already closed");
            return;
        };

        if let Some(err) = error {
            if tx.send(Err(err)).await.is_err() {
                trace!("Channel receiver gone before close error was delivered");
            }
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consuming half of a channel
#[derive(Debug)]
pub struct ChannelReader<T, E> {
    rx: mpsc::Receiver<Result<T, E>>,
    finished: bool,
}

impl<T, E> Stream for ChannelReader<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(item)) => Poll::Ready(Some(Ok(item))),
            Some(Err(err)) => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T, E> FusedStream for ChannelReader<T, E> {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use proptest::prelude::*;

    use super::*;

    #[tokio::test]
    async fn test_items_then_completion() {
        let (mut tx, rx) = channel::<u32, String>();
        let producer = tokio::spawn(async move {
            for n in 0..5 {
                tx.write(n).await.unwrap();
            }
            tx.close(None).await;
        });

        let items: Vec<_> = rx.collect().await;
        producer.await.unwrap();
        assert_eq!(items, (0..5).map(Ok).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_error_follows_items() {
        let (mut tx, rx) = channel::<u32, String>();
        tokio::spawn(async move {
            tx.write(1).await.unwrap();
            tx.close(Some("failed".to_string())).await;
        });

        let items: Vec<_> = rx.collect().await;
        assert_eq!(items, vec![Ok(1), Err("failed".to_string())]);
    }

    #[tokio::test]
    async fn test_write_after_close_fails_loudly() {
        let (mut tx, _rx) = channel::<u32, ()>();
        tx.close(None).await;
        assert!(tx.is_closed());
        assert_eq!(tx.write(1).await, Err(ChannelError::WriteAfterClose));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_first_call_wins() {
        let (mut tx, rx) = channel::<u32, &str>();
        tokio::spawn(async move {
            tx.close(Some("first")).await;
            tx.close(Some("second")).await;
            tx.close(None).await;
        });

        let items: Vec<_> = rx.collect().await;
        assert_eq!(items, vec![Err("first")]);
    }

    #[tokio::test]
    async fn test_write_after_reader_dropped() {
        let (mut tx, rx) = channel::<u32, ()>();
        drop(rx);
        assert_eq!(tx.write(1).await, Err(ChannelError::ReceiverDropped));
    }

    #[tokio::test]
    async fn test_dropped_writer_completes_reader() {
        let (tx, rx) = channel::<u32, ()>();
        drop(tx);
        let items: Vec<_> = rx.collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_reader_woken_by_write() {
        let (mut tx, rx) = channel::<u32, ()>();
        let mut rx = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(rx.poll_next());

        tx.write(7).await.unwrap();
        assert!(rx.is_woken());
        tokio_test::assert_ready_eq!(rx.poll_next(), Some(Ok(7)));

        drop(tx);
        tokio_test::assert_ready_eq!(rx.poll_next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_item_buffered_ahead() {
        let (mut tx, mut rx) = channel::<u32, ()>();

        tx.write(1).await.unwrap();
        // The slot is occupied, so the second write must wait for the consumer
        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.write(2)).await;
        assert!(blocked.is_err());

        assert_eq!(rx.next().await, Some(Ok(1)));
        tx.write(2).await.unwrap();
        assert_eq!(rx.next().await, Some(Ok(2)));
    }

    proptest! {
        #[test]
        fn prop_reader_sees_exact_write_sequence(
            items in prop::collection::vec(any::<i64>(), 0..50),
            error in prop::option::of("[a-z]{1,8}"),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let observed = runtime.block_on(async {
                let (mut tx, rx) = channel::<i64, String>();
                let to_write = items.clone();
                let close_with = error.clone();
                let producer = async move {
                    for item in to_write {
                        tx.write(item).await.unwrap();
                    }
                    tx.close(close_with).await;
                };
                let (_, observed) = tokio::join!(producer, rx.collect::<Vec<_>>());
                observed
            });

            let mut expected: Vec<Result<i64, String>> = items.into_iter().map(Ok).collect();
            if let Some(err) = error {
                expected.push(Err(err));
            }
            prop_assert_eq!(observed, expected);
        }
    }
}
