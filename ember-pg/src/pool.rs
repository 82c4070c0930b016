//! Fixed-capacity pool of live database handles.
//!
//! `acquire` blocks the calling worker until a handle is free, which gives
//! the pool counting-semaphore semantics: at most `size` borrowers at a
//! time, FIFO reuse of idle handles. The [`PooledConn`] guard returns the
//! handle on every exit path, including panics and early `?` returns.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

use crate::connection::{PgConfig, PgConnection};
use crate::error::{PgError, PgResult};

struct PoolInner {
    idle: VecDeque<PgConnection>,
    closed: bool,
}

/// A blocking pool of [`PgConnection`] handles.
pub struct PgPool {
    inner: Mutex<PoolInner>,
    available: Condvar,
    size: usize,
}

impl PgPool {
    /// Open `size` connections eagerly. Fails if any connection cannot be
    /// established, so a successful pool always holds `size` live handles.
    pub fn init(config: &PgConfig, size: usize) -> PgResult<Self> {
        assert!(size > 0);
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            idle.push_back(PgConnection::connect(config)?);
        }
        Ok(Self {
            inner: Mutex::new(PoolInner {
                idle,
                closed: false,
            }),
            available: Condvar::new(),
            size,
        })
    }

    /// Borrow a handle, blocking until one is available.
    /// Returns `Err(PoolClosed)` once `close_pool` has run.
    pub fn acquire(&self) -> PgResult<PooledConn<'_>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(PgError::PoolClosed);
            }
            if let Some(conn) = inner.idle.pop_front() {
                return Ok(PooledConn {
                    pool: self,
                    conn: Some(conn),
                });
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Shut the pool down: drop all idle handles and fail pending and
    /// future `acquire` calls. Borrowed handles are dropped as their
    /// guards return them.
    pub fn close_pool(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.idle.clear();
        self.available.notify_all();
    }

    /// Configured capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().unwrap().idle.len()
    }

    fn release(&self, conn: PgConnection) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.idle.push_back(conn);
            self.available.notify_one();
        }
        // closed: the handle is dropped here and its Terminate sent
    }
}

/// Scoped borrow of a pooled connection; returns it to the pool on drop.
pub struct PooledConn<'a> {
    pool: &'a PgPool,
    conn: Option<PgConnection>,
}

impl Deref for PooledConn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
