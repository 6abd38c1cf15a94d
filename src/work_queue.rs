// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded hand-off queue between the change reader and the worker pool.
//!
//! Like a plain async channel, but with two extras the pipeline needs:
//! multiple items can be taken in a single `get` call, and the queue can
//! be closed. After close, consumers drain whatever is left and then
//! receive the [`Dequeued::Closed`] sentinel; producers get
//! [`QueueClosed`] immediately.
//!
//! # Backpressure
//!
//! `put` suspends while the queue is at capacity. With batches of at most
//! `batch_size` events and a queue of `capacity` slots, pipeline memory is
//! bounded at `batch_size * capacity` events no matter how large the
//! source database is.
//!
//! # Ordering
//!
//! Items come out in producer order. No guarantee is made about the order
//! in which *consumers finish* processing them; that is the watermark's
//! job, not the queue's.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// Error returned when `put` is called on a closed queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("work queue is closed")]
pub struct QueueClosed;

/// Result of a `get` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    /// One or more items, in producer order.
    Items(Vec<T>),
    /// The queue is closed and fully drained. The consumer should stop.
    Closed,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO with close semantics. One producer, N consumers.
pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "work queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue an item, suspending while the queue is full.
    pub async fn put(&self, item: T) -> Result<(), QueueClosed> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(QueueClosed);
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(item);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Dequeue up to `max_items` items, suspending while the queue is
    /// empty and open. Returns [`Dequeued::Closed`] once the queue is
    /// closed and drained.
    pub async fn get(&self, max_items: usize) -> Dequeued<T> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.queue.is_empty() {
                    let count = max_items.max(1).min(inner.queue.len());
                    let items: Vec<T> = inner.queue.drain(..count).collect();
                    self.not_full.notify_one();
                    return Dequeued::Items(items);
                }
                if inner.closed {
                    // Wake sibling consumers so they observe the close too
                    self.not_empty.notify_one();
                    return Dequeued::Closed;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Close the queue. Wakes all waiting producers and consumers.
    ///
    /// Items already queued remain available to `get` until drained.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        // A consumer parked between lock release and notified() still needs
        // a stored permit to wake up
        self.not_empty.notify_one();
        self.not_full.notify_one();
    }

    /// Check if the queue is closed.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Number of queued items.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Check if there are no queued items.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.queue.is_empty()
    }
}
