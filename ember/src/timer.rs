//! Indexed binary min-heap of connection deadlines.
//!
//! Each node carries a connection id, a monotonic deadline, and the action
//! to run on expiry. An `id -> heap index` map keeps `add`/`adjust`/removal
//! at O(log n); the map always reflects current heap positions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: i32,
    expires: Instant,
    cb: TimeoutCallback,
}

pub struct HeapTimer {
    heap: Vec<TimerNode>,
    index: HashMap<i32, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
        }
    }

    /// Insert `id` with a deadline of now + `timeout_ms`. An existing id
    /// has its deadline and callback replaced, reheapifying in whichever
    /// direction the new deadline requires.
    pub fn add(&mut self, id: i32, timeout_ms: u64, cb: TimeoutCallback) {
        let expires = Instant::now() + Duration::from_millis(timeout_ms);
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].cb = cb;
            if !self.sift_down(i, self.heap.len()) {
                self.sift_up(i);
            }
        } else {
            let i = self.heap.len();
            self.index.insert(id, i);
            self.heap.push(TimerNode { id, expires, cb });
            self.sift_up(i);
        }
    }

    /// Push `id`'s deadline out to now + `timeout_ms`. Extension only ever
    /// lengthens the deadline, so a sift-down restores heap order.
    pub fn adjust(&mut self, id: i32, timeout_ms: u64) {
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].expires = Instant::now() + Duration::from_millis(timeout_ms);
            self.sift_down(i, self.heap.len());
        }
    }

    /// Run `id`'s callback now, then remove the node. Callbacks have no
    /// access to the timer, so the node's position is stable across the
    /// call.
    pub fn do_work(&mut self, id: i32) {
        if let Some(&i) = self.index.get(&id) {
            (self.heap[i].cb)();
            self.remove(i);
        }
    }

    /// Fire every node whose deadline has passed: run the root's callback,
    /// then pop it.
    pub fn tick(&mut self) {
        while !self.heap.is_empty() {
            if self.heap[0].expires > Instant::now() {
                break;
            }
            (self.heap[0].cb)();
            self.remove(0);
        }
    }

    /// Drop the root without firing it.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.remove(0);
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Fire due nodes, then report milliseconds until the next deadline;
    /// -1 when no timers remain.
    pub fn next_tick(&mut self) -> i32 {
        self.tick();
        match self.heap.first() {
            Some(root) => {
                let remaining = root.expires.saturating_duration_since(Instant::now());
                remaining.as_millis().min(i32::MAX as u128) as i32
            }
            None => -1,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.index.contains_key(&id)
    }

    /// Delete the node at `index`: swap with the tail, pop, re-sift the
    /// swapped-in element.
    fn remove(&mut self, index: usize) {
        let last = self.heap.len() - 1;
        self.swap_node(index, last);
        let node = self.heap.pop().unwrap();
        self.index.remove(&node.id);
        if index < self.heap.len() && !self.sift_down(index, self.heap.len()) {
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_node(i, parent);
            i = parent;
        }
    }

    /// Returns true when the node actually moved down.
    fn sift_down(&mut self, i: usize, n: usize) -> bool {
        let start = i;
        let mut i = i;
        let mut child = 2 * i + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[child].expires >= self.heap[i].expires {
                break;
            }
            self.swap_node(i, child);
            i = child;
            child = 2 * i + 1;
        }
        i > start
    }

    fn swap_node(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counter_cb(counter: &Arc<AtomicUsize>) -> TimeoutCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_in_deadline_order() {
        let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut timer = HeapTimer::new();
        for (id, timeout) in [(3, 30u64), (1, 0), (2, 10)] {
            let fired = Arc::clone(&fired);
            timer.add(id, timeout, Box::new(move || fired.lock().unwrap().push(id)));
        }
        assert_eq!(timer.len(), 3);

        thread::sleep(Duration::from_millis(50));
        timer.tick();
        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3]);
        assert!(timer.is_empty());
    }

    #[test]
    fn add_existing_id_updates_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        timer.add(7, 0, counter_cb(&count));
        timer.add(7, 60_000, counter_cb(&count));
        assert_eq!(timer.len(), 1);

        timer.tick(); // pushed out, must not fire
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.contains(7));
    }

    #[test]
    fn adjust_extends_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        timer.add(1, 5, counter_cb(&count));
        timer.add(2, 60_000, counter_cb(&count));
        timer.adjust(1, 60_000);

        thread::sleep(Duration::from_millis(20));
        timer.tick();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.len(), 2);
    }

    #[test]
    fn do_work_runs_and_removes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        timer.add(9, 60_000, counter_cb(&count));
        timer.do_work(9);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.contains(9));
        // unknown id is a no-op
        timer.do_work(9);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_tick_reports_root_deadline() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        assert_eq!(timer.next_tick(), -1);

        timer.add(1, 60_000, counter_cb(&count));
        timer.add(2, 10, counter_cb(&count));
        let wait = timer.next_tick();
        assert!((0..=10).contains(&wait));

        thread::sleep(Duration::from_millis(20));
        // id 2 fires inside next_tick; the remaining wait tracks id 1
        let wait = timer.next_tick();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(wait > 10);
    }

    #[test]
    fn index_map_stays_consistent_under_churn() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut timer = HeapTimer::new();
        for id in 0..32 {
            timer.add(id, 60_000 + (id as u64 * 13) % 7, counter_cb(&count));
        }
        for id in (0..32).step_by(3) {
            timer.do_work(id);
        }
        for id in 0..32 {
            let expect = id % 3 != 0;
            assert_eq!(timer.contains(id), expect, "id {}", id);
        }
        // every surviving id fires exactly once
        let survivors = (0..32).filter(|id| id % 3 != 0).count();
        let before = count.load(Ordering::SeqCst);
        for id in 0..32 {
            timer.do_work(id);
        }
        assert_eq!(count.load(Ordering::SeqCst), before + survivors);
        assert!(timer.is_empty());
    }
}
