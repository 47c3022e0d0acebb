//! Closeable multi-producer/multi-consumer queue
//!
//! Consumers observe closing as end-of-stream (`None`) once every item that
//! was enqueued before the close has been handed out. Closing wakes every
//! blocked consumer, not just one.

use std::collections::VecDeque;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ClosedError;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Result of a non-blocking pull
#[derive(Debug, PartialEq, Eq)]
pub enum TryNext<T> {
    Item(T),
    Empty,
    Closed,
}

/// FIFO queue with a terminal closed state.
pub struct CloseableQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> CloseableQueue<T> {
    /// Create an empty queue. `name` shows up in [`ClosedError`] messages.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append one item
    pub fn put(&self, item: T) -> Result<(), ClosedError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ClosedError::new(self.name));
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Append all items, or none of them if the queue is closed.
    pub fn put_many<I>(&self, items: I) -> Result<(), ClosedError>
    where
        I: IntoIterator<Item = T>,
    {
        let added = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ClosedError::new(self.name));
            }
            let before = state.items.len();
            state.items.extend(items);
            state.items.len() - before
        };
        for _ in 0..added {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Mark the queue closed. Idempotent.
    pub fn close(&self) {
        let newly_closed = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            log::debug!("Closed queue '{}'", self.name);
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull without waiting
    pub fn try_next(&self) -> TryNext<T> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => TryNext::Item(item),
            None if state.closed => TryNext::Closed,
            None => TryNext::Empty,
        }
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> Option<T> {
        loop {
            // Register interest before looking at the state so a put or close
            // racing with this check still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_next() {
                TryNext::Item(item) => return Some(item),
                TryNext::Closed => return None,
                TryNext::Empty => notified.await,
            }
        }
    }

    /// Consume the queue as a stream that ends when the queue is closed and
    /// drained.
    pub fn stream(&self) -> impl Stream<Item = T> + '_ {
        stream::unfold(self, |queue| async move {
            queue.next().await.map(|item| (item, queue))
        })
    }
}

impl<T> std::fmt::Debug for CloseableQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CloseableQueue")
            .field("name", &self.name)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}
