//! Thread-safe bounded/unbounded FIFO queue with blocking pop.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Multiple-producer, multiple-consumer FIFO.
pub struct ConcurrentQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    /// An empty queue.
    pub fn new() -> Self {
        ConcurrentQueue {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    /// Push unconditionally, waking one waiter.
    pub fn push(&self, value: T) {
        let mut queue = self.inner.lock().unwrap();
        queue.push_back(value);
        self.not_empty.notify_all();
    }

    /// Push iff the queue's current size is `<= max_size`, waking one
    /// waiter on success.
    ///
    /// Note: the admission test is `<=`, not `<`, so the effective maximum
    /// occupancy after this call succeeds is `max_size + 1`. This mirrors
    /// the original queue's `push_size` exactly and is intentionally kept
    /// rather than "fixed".
    pub fn push_bounded(&self, value: T, max_size: usize) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() <= max_size {
            queue.push_back(value);
            self.not_empty.notify_all();
            true
        } else {
            false
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Block until an item is available, then pop it.
    pub fn wait_pop(&self) -> T {
        let mut queue = self.inner.lock().unwrap();
        loop {
            if let Some(value) = queue.pop_front() {
                return value;
            }
            queue = self.not_empty.wait(queue).unwrap();
        }
    }

    /// Current number of queued items.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the queue currently has no items.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drain every queued item.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
