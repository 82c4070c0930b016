//! Per-connection state: socket, buffers, parser, response, and the
//! read/process/write stages executed by the worker pool.
//!
//! Writes are scatter-gather: one `writev` covers the header bytes still in
//! the write buffer and the unsent tail of the mmap'd file. Partial
//! progress advances the two regions exactly, so a short write never
//! repeats or skips bytes.

use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use ember_pg::PgPool;

use crate::buffer::Buffer;
use crate::request::{HttpRequest, ParseState};
use crate::response::HttpResponse;
use crate::syscalls;
use crate::{log_debug, log_info};

/// Keep draining in level-triggered mode while at least this many bytes
/// remain pending.
const WRITE_CONTINUE_BYTES: usize = 10240;

/// State shared by every connection: resource root, trigger discipline,
/// live-connection counter, and the database pool.
pub struct ConnContext {
    pub src_dir: PathBuf,
    pub is_et: bool,
    pub max_body_bytes: usize,
    pub user_count: AtomicI32,
    pub db: Option<PgPool>,
}

pub struct HttpConn {
    fd: RawFd,
    addr: SocketAddrV4,
    open: bool,
    file_written: usize,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    ctx: Arc<ConnContext>,
}

impl HttpConn {
    pub fn new(fd: RawFd, addr: SocketAddrV4, ctx: Arc<ConnContext>) -> Self {
        let count = ctx.user_count.fetch_add(1, Ordering::AcqRel) + 1;
        log_info!("Client[{}]({}) in, userCount:{}", fd, addr, count);
        Self {
            fd,
            addr,
            open: true,
            file_written: 0,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            ctx,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Keep-alive as decided by the last built response.
    pub fn is_keep_alive(&self) -> bool {
        self.response.keep_alive()
    }

    /// Bytes still owed to the socket: buffered headers plus unsent file.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes()
            + self.response.file_len().saturating_sub(self.file_written)
    }

    /// Drain the socket into the read buffer. Edge-triggered connections
    /// loop until the kernel reports would-block.
    ///
    /// `Ok(0)` is EOF with nothing buffered; `Err(WouldBlock)` is a
    /// spurious wakeup with no data.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break; // socket drained
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Vectored write of headers + file. Loops while edge-triggered or
    /// while more than the high-water mark remains; `Err(WouldBlock)` asks
    /// the reactor to re-arm for OUT.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let header_len = self.write_buf.readable_bytes();
            let n = {
                let mut parts: [&[u8]; 2] = [&[], &[]];
                let mut cnt = 0;
                if header_len > 0 {
                    parts[cnt] = self.write_buf.peek();
                    cnt += 1;
                }
                if let Some(mapped) = self.response.file() {
                    if self.file_written < mapped.len() {
                        parts[cnt] = &mapped.as_slice()[self.file_written..];
                        cnt += 1;
                    }
                }
                syscalls::writev(self.fd, &parts[..cnt])?
            };
            if n == 0 {
                break;
            }
            if n > header_len {
                self.file_written += n - header_len;
                if header_len > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;
            if self.to_write_bytes() == 0 {
                break;
            }
            if !self.ctx.is_et && self.to_write_bytes() <= WRITE_CONTINUE_BYTES {
                break;
            }
        }
        Ok(total)
    }

    /// Parse buffered bytes and, on a complete request, build the response.
    /// Returns true when there is output to write; false re-arms for read.
    pub fn process(&mut self) -> bool {
        if self.request.state() == ParseState::Finish {
            // previous request completed: start the next one
            self.request.init();
        }
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }

        match self
            .request
            .parse(&mut self.read_buf, self.ctx.db.as_ref(), self.ctx.max_body_bytes)
        {
            Ok(true) => {
                log_debug!("request {:?} from {}", self.request.path(), self.addr);
                let path = self.request.path().to_string();
                let keep_alive = self.request.is_keep_alive();
                self.response
                    .init(&self.ctx.src_dir, path, keep_alive, None);
            }
            Ok(false) => return false,
            Err(e) => {
                log_debug!("bad request from {}: {}", self.addr, e);
                let path = self.request.path().to_string();
                self.response
                    .init(&self.ctx.src_dir, path, false, Some(400));
                // drop whatever garbage remains on this connection
                self.read_buf.retrieve_all();
                self.request.init();
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.file_written = 0;
        true
    }

    /// Idempotent: unmaps the payload, closes the socket, and decrements
    /// the live-connection count exactly once.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.response.unmap_file();
        syscalls::close_fd(self.fd);
        let count = self.ctx.user_count.fetch_sub(1, Ordering::AcqRel) - 1;
        log_info!("Client[{}]({}) quit, userCount:{}", self.fd, self.addr, count);
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
