//! Bounded MPMC blocking queue with close semantics.
//!
//! Producers park when the queue is full, consumers park when it is empty.
//! `close` unblocks both sides; a pop on an empty, closed queue returns
//! `None` so consumers can drain remaining items before exiting.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub const DEFAULT_CAPACITY: usize = 1000;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BlockQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item, blocking while the queue is full.
    /// Returns false (dropping the item) if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue an item, blocking while the queue is empty.
    /// Returns `None` once the queue is both empty and closed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Wake one consumer (used by the logger's flush).
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }

    /// Close the queue and wake everyone parked on it.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.items.len() >= self.capacity
    }
}
