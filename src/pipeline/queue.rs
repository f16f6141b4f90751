//! Blocking work queue shared by producers and a pool of consumers.
//!
//! The queue is a mutex-protected deque paired with a [`Notify`] acting as
//! its condition variable. Consumers wait in [`WorkQueue::dequeue`] until an
//! item arrives or the queue is closed; a closed queue still hands out what
//! it holds and only then reports `None`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::CubbyError;

/// Order in which queued items are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// Arrival order.
    #[default]
    Fifo,
    /// Highest priority first, arrival order among equal priorities.
    Priority,
}

/// Why an item was not queued. The item is handed back to the caller.
#[derive(Error)]
pub enum EnqueueError<T> {
    /// The queue is at capacity.
    #[error("{0} queue is full")]
    Full(&'static str, T),
    /// The queue was closed.
    #[error("{0} queue is closed")]
    Closed(&'static str, T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(_, item) | EnqueueError::Closed(_, item) => item,
        }
    }
}

impl<T> std::fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::Full(name, _) => f.debug_tuple("Full").field(name).finish(),
            EnqueueError::Closed(name, _) => f.debug_tuple("Closed").field(name).finish(),
        }
    }
}

impl<T> From<EnqueueError<T>> for CubbyError {
    fn from(e: EnqueueError<T>) -> Self {
        match e {
            EnqueueError::Full(name, _) => CubbyError::QueueFull(name),
            EnqueueError::Closed(name, _) => CubbyError::QueueClosed(name),
        }
    }
}

struct Entry<T> {
    priority: i32,
    item: T,
}

struct QueueState<T> {
    items: VecDeque<Entry<T>>,
    closed: bool,
}

/// Thread-safe FIFO or priority queue with blocking dequeue.
pub struct WorkQueue<T> {
    name: &'static str,
    order: QueueOrder,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T> WorkQueue<T> {
    /// Create a queue. A `capacity` of 0 means unbounded.
    pub fn new(name: &'static str, order: QueueOrder, capacity: usize) -> Self {
        Self {
            name,
            order,
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ordering policy of this queue.
    pub fn order(&self) -> QueueOrder {
        self.order
    }

    /// Capacity (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item with the default priority.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        self.enqueue_with_priority(item, 0)
    }

    /// Queue an item. `priority` only matters in [`QueueOrder::Priority`].
    pub fn enqueue_with_priority(&self, item: T, priority: i32) -> Result<(), EnqueueError<T>> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(EnqueueError::Closed(self.name, item));
            }
            if self.capacity > 0 && state.items.len() >= self.capacity {
                return Err(EnqueueError::Full(self.name, item));
            }

            let entry = Entry { priority, item };
            match self.order {
                QueueOrder::Fifo => state.items.push_back(entry),
                QueueOrder::Priority => {
                    let at = state
                        .items
                        .iter()
                        .position(|queued| queued.priority < priority)
                        .unwrap_or(state.items.len());
                    state.items.insert(at, entry);
                }
            }
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the next item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(entry) = state.items.pop_front() {
                    return Some(entry.item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new items and wake every waiting consumer. Idempotent.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
