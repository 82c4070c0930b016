//! Leveled logging with optional asynchronous draining.
//!
//! A process-wide singleton with an explicit `init`/`close` lifecycle. With
//! a queue capacity of zero every call writes straight to the log file under
//! the internal mutex; with a positive capacity, lines are handed to a
//! bounded [`BlockQueue`] and a dedicated writer thread drains them.
//!
//! Files are named `<dir>/YYYY_MM_DD<suffix>` and rotate on day change or
//! every [`MAX_LINES`] lines (`-N` suffix). A failed log write is dropped;
//! the logger never propagates errors into the server.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use chrono::{Datelike, Local};

use crate::blockqueue::BlockQueue;

/// Rotation threshold within a single day.
pub const MAX_LINES: usize = 50_000;

pub const LEVEL_DEBUG: usize = 0;
pub const LEVEL_INFO: usize = 1;
pub const LEVEL_WARN: usize = 2;
pub const LEVEL_ERROR: usize = 3;

struct LogInner {
    file: File,
    dir: PathBuf,
    suffix: String,
    line_count: usize,
    day: u32,
    queue: Option<Arc<BlockQueue<String>>>,
    writer: Option<JoinHandle<()>>,
}

pub struct Log {
    inner: Mutex<Option<LogInner>>,
    level: AtomicUsize,
    open: AtomicBool,
}

static INSTANCE: OnceLock<Log> = OnceLock::new();

impl Log {
    pub fn instance() -> &'static Log {
        INSTANCE.get_or_init(|| Log {
            inner: Mutex::new(None),
            level: AtomicUsize::new(LEVEL_INFO),
            open: AtomicBool::new(false),
        })
    }

    /// (Re-)initialise the logger. `queue_capacity > 0` selects async mode.
    pub fn init(&self, level: usize, dir: &str, suffix: &str, queue_capacity: usize) {
        self.close();

        let dir = PathBuf::from(dir);
        let _ = fs::create_dir_all(&dir);
        let now = Local::now();
        let name = format!("{}{}", now.format("%Y_%m_%d"), suffix);
        let file = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))
        {
            Ok(f) => f,
            Err(_) => return, // stay closed; log calls become no-ops
        };

        let (queue, writer) = if queue_capacity > 0 {
            let queue = Arc::new(BlockQueue::new(queue_capacity));
            let drain = Arc::clone(&queue);
            let writer = thread::Builder::new()
                .name("ember-log".to_string())
                .spawn(move || async_write_loop(drain))
                .ok();
            (Some(queue), writer)
        } else {
            (None, None)
        };

        *self.inner.lock().unwrap() = Some(LogInner {
            file,
            dir,
            suffix: suffix.to_string(),
            line_count: 0,
            day: now.day(),
            queue,
            writer,
        });
        self.level.store(level, Ordering::Relaxed);
        self.open.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: usize) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// Call-site filter: lines below the current level are dropped before
    /// any formatting happens.
    pub fn should_log(&self, level: usize) -> bool {
        self.is_open() && level >= self.level()
    }

    pub fn write(&self, level: usize, args: fmt::Arguments<'_>) {
        let now = Local::now();
        let mut guard = self.inner.lock().unwrap();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => return,
        };

        if inner.day != now.day() || (inner.line_count > 0 && inner.line_count % MAX_LINES == 0) {
            let tail = now.format("%Y_%m_%d");
            let name = if inner.day != now.day() {
                inner.day = now.day();
                inner.line_count = 0;
                format!("{}{}", tail, inner.suffix)
            } else {
                format!("{}-{}{}", tail, inner.line_count / MAX_LINES, inner.suffix)
            };
            if let Ok(file) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(inner.dir.join(name))
            {
                let _ = inner.file.flush();
                inner.file = file;
            }
        }

        inner.line_count += 1;
        let line = format!(
            "{} {} {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.6f"),
            level_title(level),
            args
        );

        // All producers hold the logger mutex, so a non-full queue cannot
        // fill up before the push: only the writer thread removes items.
        match &inner.queue {
            Some(queue) if !queue.is_full() => {
                queue.push(line);
            }
            _ => {
                let _ = inner.file.write_all(line.as_bytes());
            }
        }
    }

    /// Wake the async writer (sync mode flushes the file stream).
    pub fn flush(&self) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(inner) = guard.as_mut() {
            match &inner.queue {
                Some(queue) => queue.flush(),
                None => {
                    let _ = inner.file.flush();
                }
            }
        }
    }

    /// Drain the queue, join the writer thread, and close the file.
    pub fn close(&self) {
        let (queue, writer) = {
            let mut guard = self.inner.lock().unwrap();
            match guard.as_mut() {
                Some(inner) => (inner.queue.take(), inner.writer.take()),
                None => (None, None),
            }
        };
        if let Some(queue) = queue {
            queue.close();
        }
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let mut guard = self.inner.lock().unwrap();
        if let Some(mut inner) = guard.take() {
            let _ = inner.file.flush();
        }
        self.open.store(false, Ordering::Release);
    }
}

fn async_write_loop(queue: Arc<BlockQueue<String>>) {
    while let Some(line) = queue.pop() {
        let log = Log::instance();
        let mut guard = log.inner.lock().unwrap();
        if let Some(inner) = guard.as_mut() {
            let _ = inner.file.write_all(line.as_bytes());
        }
    }
}

fn level_title(level: usize) -> &'static str {
    match level {
        LEVEL_DEBUG => "[debug]:",
        LEVEL_WARN => "[warn] :",
        LEVEL_ERROR => "[error]:",
        _ => "[info] :",
    }
}

#[macro_export]
macro_rules! log_write {
    ($level:expr, $($arg:tt)+) => {{
        let log = $crate::log::Log::instance();
        if log.should_log($level) {
            log.write($level, format_args!($($arg)+));
            log.flush();
        }
    }};
}

#[macro_export]
macro_rules! log_debug { ($($arg:tt)+) => { $crate::log_write!($crate::log::LEVEL_DEBUG, $($arg)+) }; }
#[macro_export]
macro_rules! log_info { ($($arg:tt)+) => { $crate::log_write!($crate::log::LEVEL_INFO, $($arg)+) }; }
#[macro_export]
macro_rules! log_warn { ($($arg:tt)+) => { $crate::log_write!($crate::log::LEVEL_WARN, $($arg)+) }; }
#[macro_export]
macro_rules! log_error { ($($arg:tt)+) => { $crate::log_write!($crate::log::LEVEL_ERROR, $($arg)+) }; }
