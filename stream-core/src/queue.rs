//! Bounded operation queue for fedistream.
//!
//! This module provides a FIFO queue for incoming operations with:
//! - FIFO ordering for dispatch
//! - A max size, enforced by dropping the oldest entry (never blocking)
//!
//! The queue sits between the transport and the handlers: operations are
//! pushed as they arrive and drained in one batch per debounce cycle.

use fedistream_types::StreamingOperation;
use std::collections::VecDeque;

/// Queue of pending operations awaiting dispatch.
pub type OperationQueue = BoundedQueue<StreamingOperation>;

/// FIFO queue with drop-oldest backpressure.
///
/// Items flow through the queue in this order:
/// 1. `push()` - add to the back, evicting the front if over capacity
/// 2. `drain()` - take everything, oldest first
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    /// Maximum number of queued items.
    max_size: usize,
    /// Items waiting to be dispatched.
    queue: VecDeque<T>,
}

impl<T> BoundedQueue<T> {
    /// Create a new queue with the given maximum size.
    ///
    /// A max size of zero is treated as one.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            queue: VecDeque::new(),
        }
    }

    /// Add an item to the back of the queue.
    ///
    /// If the queue is already full, the oldest item is removed and returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        let dropped = if self.queue.len() >= self.max_size {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(item);
        dropped
    }

    /// Remove and return the next item.
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Remove and return every queued item, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    /// Number of items in the queue.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Clear all items.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
