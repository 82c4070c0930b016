//! The reactor: one thread owns the epoll instance and the timer, accepts
//! connections, and hands read/write stages to the worker pool.
//!
//! Connection fds are registered one-shot, so a fd is never dispatched to
//! two workers at once; every stage ends by explicitly re-arming the fd for
//! its next direction. The user table maps fd -> connection and is the
//! lifetime root: an entry exists exactly while the connection is open.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use ember_pg::{PgConfig, PgPool};

use crate::config::ServerConfig;
use crate::conn::{ConnContext, HttpConn};
use crate::epoll::{
    event_buffer, Epoller, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_ONESHOT, EV_OUT, EV_RDHUP,
    MAX_EVENTS,
};
use crate::error::EmberResult;
use crate::log::Log;
use crate::syscalls;
use crate::threadpool::ThreadPool;
use crate::timer::HeapTimer;
use crate::{log_error, log_info, log_warn};

/// Ceiling on simultaneously open connections.
pub const MAX_FD: usize = 65536;

/// Upper bound on one epoll wait so the shutdown flag is observed even
/// with no pending timers.
const SHUTDOWN_POLL_MS: i32 = 5000;

type UserMap = Arc<Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>>;

pub struct WebServer {
    listen_fd: RawFd,
    port: u16,
    listen_event: u32,
    conn_event: u32,
    timeout_ms: u64,
    is_close: Arc<AtomicBool>,
    timer: HeapTimer,
    threadpool: ThreadPool,
    epoller: Arc<Epoller>,
    events: Vec<libc::epoll_event>,
    users: UserMap,
    ctx: Arc<ConnContext>,
}

impl WebServer {
    pub fn new(config: ServerConfig) -> EmberResult<Self> {
        if config.open_log {
            Log::instance().init(config.log_level, "./log", ".log", config.log_queue_size);
        }

        let src_dir = match config.src_dir.clone() {
            Some(dir) => dir,
            None => env::current_dir()?.join("resources"),
        };

        let db = if config.conn_pool_size > 0 {
            let pg = PgConfig::new(
                &config.sql_host,
                config.sql_port,
                &config.sql_user,
                &config.sql_password,
                &config.db_name,
            );
            match PgPool::init(&pg, config.conn_pool_size) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    log_warn!("database pool unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (listen_event, conn_event) = event_mode(config.trig_mode);
        let ctx = Arc::new(ConnContext {
            src_dir,
            is_et: conn_event & EV_ET != 0,
            max_body_bytes: config.max_body_bytes,
            user_count: AtomicI32::new(0),
            db,
        });

        let listen_fd = syscalls::create_listen_socket(config.port)?;
        let port = syscalls::local_port(listen_fd)?;
        let epoller = Arc::new(Epoller::new()?);
        if let Err(e) = epoller.add_fd(listen_fd, listen_event | EV_IN) {
            log_error!("failed to register listener: {}", e);
            syscalls::close_fd(listen_fd);
            return Err(e);
        }
        syscalls::set_fd_nonblock(listen_fd)?;

        log_info!("========== Server init ==========");
        log_info!(
            "Port:{}, Listen Mode: {}, OpenConn Mode: {}",
            port,
            if listen_event & EV_ET != 0 { "ET" } else { "LT" },
            if conn_event & EV_ET != 0 { "ET" } else { "LT" },
        );
        log_info!("srcDir: {}", ctx.src_dir.display());
        log_info!(
            "SqlConnPool num: {}, ThreadPool num: {}",
            ctx.db.as_ref().map_or(0, PgPool::size),
            config.thread_pool_size
        );

        Ok(Self {
            listen_fd,
            port,
            listen_event,
            conn_event,
            timeout_ms: config.timeout_ms,
            is_close: Arc::new(AtomicBool::new(false)),
            timer: HeapTimer::new(),
            threadpool: ThreadPool::new(config.thread_pool_size),
            epoller,
            events: event_buffer(MAX_EVENTS),
            users: Arc::new(Mutex::new(HashMap::new())),
            ctx,
        })
    }

    /// The bound port; differs from the configured one when binding port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Flag observed by the main loop; set it (e.g. from a signal handler)
    /// to stop the server.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_close)
    }

    /// Open connections right now.
    pub fn user_count(&self) -> i32 {
        self.ctx.user_count.load(Ordering::Acquire)
    }

    /// Shared connection context; lets callers watch the live-connection
    /// counter after the server moves onto its own thread.
    pub fn conn_context(&self) -> Arc<ConnContext> {
        Arc::clone(&self.ctx)
    }

    /// Run the event loop until the shutdown flag is set.
    pub fn start(&mut self) {
        log_info!("========== Server start ==========");
        while !self.is_close.load(Ordering::Acquire) {
            let mut time_ms = -1;
            if self.timeout_ms > 0 {
                time_ms = self.timer.next_tick();
            }
            if time_ms < 0 || time_ms > SHUTDOWN_POLL_MS {
                time_ms = SHUTDOWN_POLL_MS;
            }
            let n = self.epoller.wait(&mut self.events, time_ms);
            for i in 0..n {
                let fd = Epoller::event_fd(&self.events[i]);
                let mask = Epoller::event_mask(&self.events[i]);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if mask & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    if let Some(conn) = self.lookup(fd) {
                        close_conn(&self.epoller, &self.users, &conn);
                    }
                } else if mask & EV_IN != 0 {
                    if let Some(conn) = self.lookup(fd) {
                        self.deal_read(fd, &conn);
                    }
                } else if mask & EV_OUT != 0 {
                    if let Some(conn) = self.lookup(fd) {
                        self.deal_write(fd, &conn);
                    }
                } else {
                    log_error!("unexpected event mask {:#x} on fd {}", mask, fd);
                }
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        log_info!("========== Server quit ==========");
        self.timer.clear();
        let drained: Vec<_> = self.users.lock().unwrap().drain().collect();
        for (_, conn) in drained {
            close_conn(&self.epoller, &self.users, &conn);
        }
        if let Some(db) = &self.ctx.db {
            db.close_pool();
        }
        Log::instance().flush();
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<Mutex<HttpConn>>> {
        self.users.lock().unwrap().get(&fd).cloned()
    }

    /// Accept pending connections; loops until drained when the listener
    /// is edge-triggered.
    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => {
                    if self.user_count() as usize >= MAX_FD {
                        syscalls::send_bytes(fd, b"Server busy!");
                        syscalls::close_fd(fd);
                        log_warn!("clients are full, rejecting fd {}", fd);
                    } else {
                        self.add_client(fd, addr);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log_warn!("accept failed: {}", e);
                    break;
                }
            }
            if self.listen_event & EV_ET == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddrV4) {
        let conn = Arc::new(Mutex::new(HttpConn::new(fd, addr, Arc::clone(&self.ctx))));
        self.users.lock().unwrap().insert(fd, Arc::clone(&conn));

        if self.timeout_ms > 0 {
            let epoller = Arc::clone(&self.epoller);
            let users = Arc::clone(&self.users);
            let expired = Arc::clone(&conn);
            self.timer.add(
                fd,
                self.timeout_ms,
                Box::new(move || close_conn(&epoller, &users, &expired)),
            );
        }

        if let Err(e) = self.epoller.add_fd(fd, EV_IN | self.conn_event) {
            log_error!("failed to register client fd {}: {}", fd, e);
            close_conn(&self.epoller, &self.users, &conn);
            return;
        }
        syscalls::set_fd_nonblock(fd).ok();
    }

    fn deal_read(&mut self, fd: RawFd, conn: &Arc<Mutex<HttpConn>>) {
        self.extent_time(fd);
        let conn = Arc::clone(conn);
        let epoller = Arc::clone(&self.epoller);
        let users = Arc::clone(&self.users);
        let conn_event = self.conn_event;
        self.threadpool
            .add_task(move || on_read(&conn, &epoller, &users, conn_event));
    }

    fn deal_write(&mut self, fd: RawFd, conn: &Arc<Mutex<HttpConn>>) {
        self.extent_time(fd);
        let conn = Arc::clone(conn);
        let epoller = Arc::clone(&self.epoller);
        let users = Arc::clone(&self.users);
        let conn_event = self.conn_event;
        self.threadpool
            .add_task(move || on_write(&conn, &epoller, &users, conn_event));
    }

    /// Push the idle deadline out; never touches the connection lock, so a
    /// busy worker cannot stall the reactor here.
    fn extent_time(&mut self, fd: RawFd) {
        if self.timeout_ms > 0 {
            self.timer.adjust(fd, self.timeout_ms);
        }
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        self.is_close.store(true, Ordering::Release);
        syscalls::close_fd(self.listen_fd);
        if let Some(db) = &self.ctx.db {
            db.close_pool();
        }
    }
}

/// Map `trig_mode` onto (listener, connection) event masks. `RDHUP` is
/// always watched; connections are always one-shot so a fd cannot reach
/// two workers at once.
fn event_mode(trig_mode: u8) -> (u32, u32) {
    let mut listen_event = EV_RDHUP;
    let mut conn_event = EV_ONESHOT | EV_RDHUP;
    match trig_mode {
        0 => {}
        1 => conn_event |= EV_ET,
        2 => listen_event |= EV_ET,
        _ => {
            listen_event |= EV_ET;
            conn_event |= EV_ET;
        }
    }
    (listen_event, conn_event)
}

/// Shared close path, callable from the reactor, timer callbacks, and
/// workers hitting fatal I/O errors. Guarded by the connection's open flag,
/// so double close keeps the user count intact.
fn close_conn(epoller: &Epoller, users: &Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>, conn: &Arc<Mutex<HttpConn>>) {
    let fd = {
        let mut guard = conn.lock().unwrap();
        if !guard.is_open() {
            return;
        }
        let fd = guard.fd();
        epoller.del_fd(fd).ok();
        guard.close();
        fd
    };
    users.lock().unwrap().remove(&fd);
}

/// Worker stage: drain the socket, then parse/build.
fn on_read(
    conn: &Arc<Mutex<HttpConn>>,
    epoller: &Epoller,
    users: &Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>,
    conn_event: u32,
) {
    let mut guard = conn.lock().unwrap();
    if !guard.is_open() {
        return;
    }
    match guard.read() {
        Ok(0) => {
            drop(guard);
            close_conn(epoller, users, conn);
            return;
        }
        Err(e) if e.kind() != std::io::ErrorKind::WouldBlock => {
            drop(guard);
            close_conn(epoller, users, conn);
            return;
        }
        _ => {}
    }
    on_process(&mut guard, epoller, conn_event);
}

/// Re-arm for the direction the connection needs next.
fn on_process(conn: &mut HttpConn, epoller: &Epoller, conn_event: u32) {
    let fd = conn.fd();
    if conn.process() {
        epoller.mod_fd(fd, conn_event | EV_OUT).ok();
    } else {
        epoller.mod_fd(fd, conn_event | EV_IN).ok();
    }
}

/// Worker stage: push pending bytes; finished keep-alive connections go
/// back to reading, blocked ones re-arm for OUT, the rest close.
fn on_write(
    conn: &Arc<Mutex<HttpConn>>,
    epoller: &Epoller,
    users: &Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>,
    conn_event: u32,
) {
    let mut guard = conn.lock().unwrap();
    if !guard.is_open() {
        return;
    }
    let fd = guard.fd();
    match guard.write() {
        Ok(_) => {
            if guard.to_write_bytes() == 0 && guard.is_keep_alive() {
                epoller.mod_fd(fd, conn_event | EV_IN).ok();
                return;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            epoller.mod_fd(fd, conn_event | EV_OUT).ok();
            return;
        }
        Err(_) => {}
    }
    drop(guard);
    close_conn(epoller, users, conn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mode_table() {
        let (l0, c0) = event_mode(0);
        assert_eq!(l0, EV_RDHUP);
        assert_eq!(c0, EV_ONESHOT | EV_RDHUP);

        let (l1, c1) = event_mode(1);
        assert_eq!(l1 & EV_ET, 0);
        assert_ne!(c1 & EV_ET, 0);

        let (l2, c2) = event_mode(2);
        assert_ne!(l2 & EV_ET, 0);
        assert_eq!(c2 & EV_ET, 0);

        let (l3, c3) = event_mode(3);
        assert_ne!(l3 & EV_ET, 0);
        assert_ne!(c3 & EV_ET, 0);
        // one-shot is never optional on connections
        for c in [c0, c1, c2, c3] {
            assert_ne!(c & EV_ONESHOT, 0);
            assert_ne!(c & EV_RDHUP, 0);
        }
    }
}
