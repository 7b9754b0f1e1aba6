//! Fan one source out to several independent consumers
//!
//! All branches share a buffer of items not yet seen by every live branch. Whichever
//! branch runs ahead polls the source; the others read from the buffer. A failure is
//! shared by reference so each branch observes the same error.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{PipelineError, Result};

type Shared<T> = std::result::Result<T, Arc<PipelineError>>;

struct State<T> {
    source: Option<BoxStream<'static, Result<T>>>,
    buffer: VecDeque<Shared<T>>,
    /// Absolute index of `buffer[0]`
    base: usize,
    /// Next absolute index per branch; `None` once the branch is dropped
    cursors: Vec<Option<usize>>,
    waiting: Vec<Option<Waker>>,
}

impl<T> State<T> {
    /// Drop items every live branch has consumed
    fn trim(&mut self) {
        let slowest = self.cursors.iter().flatten().min().copied();
        let keep_from = slowest.unwrap_or(self.base + self.buffer.len());
        while self.base < keep_from && self.buffer.pop_front().is_some() {
            self.base += 1;
        }
    }

    fn wake_others(&mut self, me: usize) {
        for (id, slot) in self.waiting.iter_mut().enumerate() {
            if id != me {
                if let Some(waker) = slot.take() {
                    waker.wake();
                }
            }
        }
    }
}

/// One consumer of a shared source
pub(crate) struct TeeBranch<T> {
    id: usize,
    state: Arc<Mutex<State<T>>>,
    done: bool,
}

pub(crate) fn tee<T>(source: BoxStream<'static, Result<T>>, n: usize) -> Vec<TeeBranch<T>> {
    let state = Arc::new(Mutex::new(State {
        source: Some(source),
        buffer: VecDeque::new(),
        base: 0,
        cursors: vec![Some(0); n],
        waiting: (0..n).map(|_| None).collect(),
    }));

    (0..n)
        .map(|id| TeeBranch {
            id,
            state: Arc::clone(&state),
            done: false,
        })
        .collect()
}

impl<T: Clone> Stream for TeeBranch<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        let mut state = this.state.lock();
        let Some(cursor) = state.cursors[this.id] else {
            return Poll::Ready(None);
        };

        let item = if cursor < state.base + state.buffer.len() {
            state.buffer[cursor - state.base].clone()
        } else {
            let Some(source) = state.source.as_mut() else {
                this.done = true;
                return Poll::Ready(None);
            };

            match source.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => {
                    let item = item.map_err(PipelineError::into_shared);
                    if item.is_err() {
                        state.source = None;
                    }
                    state.buffer.push_back(item.clone());
                    state.wake_others(this.id);
                    item
                }
                Poll::Ready(None) => {
                    state.source = None;
                    state.wake_others(this.id);
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    state.waiting[this.id] = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        };

        state.cursors[this.id] = Some(cursor + 1);
        state.trim();
        trace!(branch = this.id, buffered = state.buffer.len(), "Tee advanced");

        Poll::Ready(Some(item.map_err(PipelineError::Shared)))
    }
}

impl<T: Clone> FusedStream for TeeBranch<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for TeeBranch<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.cursors[self.id] = None;
        state.waiting[self.id] = None;
        state.trim();
        // The dropped branch may have been the one the source would wake
        state.wake_others(self.id);
    }
}
