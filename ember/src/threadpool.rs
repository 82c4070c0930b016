//! Fixed-size worker pool over a shared FIFO of boxed jobs.
//!
//! Workers park on a condition variable and pop one job at a time with the
//! lock released during execution. Dropping the pool closes the queue,
//! wakes every worker, and joins them; queued jobs are drained before the
//! workers exit, so no accepted task is silently lost.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    tasks: VecDeque<Job>,
    closed: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    ready: Condvar,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Enqueue a job; never blocks the caller.
    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.tasks.push_back(Box::new(task));
        self.shared.ready.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
        }
        self.shared.ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            task();
            state = shared.state.lock().unwrap();
        } else if state.closed {
            break;
        } else {
            state = shared.ready.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_every_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(4);
        for _ in 0..100 {
            let count = Arc::clone(&count);
            pool.add_task(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(1);
            for _ in 0..50 {
                let count = Arc::clone(&count);
                pool.add_task(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
            // drop joins the worker after the queue is drained
        }
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }
}
