//! Bounded FIFO queue connecting two pipeline stages
//!
//! Producers wait while the queue is full, the single consumer waits while
//! it is empty. Unlike a plain channel the owner can drop every queued item
//! out of band with [`BoundedQueue::clear`], which is how barge-in discards
//! pending sentences and clips.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Item handed back by [`BoundedQueue::push`] after the queue was closed
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed<T>(pub T);

struct QueueState<T> {
    items: VecDeque<T>,
    /// Popped but not yet marked done
    in_progress: usize,
    closed: bool,
}

/// Bounded, ordered, clearable queue
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                in_progress: 0,
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Returns the item back if the queue has been closed
    pub async fn push(&self, item: T) -> std::result::Result<(), QueueClosed<T>> {
        loop {
            let writable = self.writable.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueClosed(item));
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    /// Take the oldest item, waiting while the queue is empty
    ///
    /// The item counts as in progress until [`done`](Self::done) is called.
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let readable = self.readable.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    state.in_progress += 1;
                    drop(state);
                    self.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    /// Mark one popped item as fully handled
    pub fn done(&self) {
        let mut state = self.lock();
        state.in_progress = state.in_progress.saturating_sub(1);
    }

    /// Whether nothing is queued and every popped item is done
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.items.is_empty() && state.in_progress == 0
    }

    /// Drop every queued item, returning how many were discarded
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            let n = state.items.len();
            state.items.clear();
            n
        };
        if discarded > 0 {
            self.writable.notify_waiters();
        }
        discarded
    }

    /// Close the queue: pushes fail, pops drain what is left then end
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Maximum number of queued items
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
