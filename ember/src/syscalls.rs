//! Raw socket and memory-mapping syscalls, concentrated in one module.
//!
//! Everything unsafe the engine needs from libc lives here with a safe
//! error-mapped surface: listener construction, accept, non-blocking mode,
//! vectored writes, and read-only file mappings.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use crate::error::EmberResult;

/// Listen backlog for the accept queue.
const BACKLOG: libc::c_int = 8;

/// Create the listening socket: IPv4, SO_REUSEADDR, bound to
/// `INADDR_ANY:port`, listening. Non-blocking mode is applied separately by
/// the caller after epoll registration.
pub fn create_listen_socket(port: u16) -> EmberResult<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let optval: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of_val(&optval) as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, BACKLOG) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// The locally bound port; lets callers bind port 0 and discover the
/// kernel-assigned one.
pub fn local_port(fd: RawFd) -> EmberResult<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

/// Accept one connection. `Ok(None)` means the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddrV4)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let peer = SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        );
        Ok(Some((fd, peer)))
    }
}

pub fn set_fd_nonblock(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Best-effort short send, used for the "Server busy!" reply at capacity.
pub fn send_bytes(fd: RawFd, data: &[u8]) -> isize {
    unsafe { libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), 0) }
}

/// Scatter-gather write over up to two regions in one syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    debug_assert!(!bufs.is_empty() && bufs.len() <= 2);
    let mut iov = [libc::iovec {
        iov_base: std::ptr::null_mut(),
        iov_len: 0,
    }; 2];
    for (i, buf) in bufs.iter().enumerate() {
        iov[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
    }
    let n = unsafe { libc::writev(fd, iov.as_ptr(), bufs.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Map `len` bytes of `fd` read-only and private. `len` must be non-zero.
pub fn mmap_readonly(fd: RawFd, len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

pub fn munmap(ptr: *mut u8, len: usize) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_and_reports_port() {
        let fd = create_listen_socket(0).unwrap();
        let port = local_port(fd).unwrap();
        assert_ne!(port, 0);
        close_fd(fd);
    }

    #[test]
    fn writev_spans_two_regions() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let n = writev(fds[1], &[b"head:", b"body"]).unwrap();
        assert_eq!(n, 9);

        let mut buf = [0u8; 16];
        let got = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(&buf[..got as usize], b"head:body");
        close_fd(fds[0]);
        close_fd(fds[1]);
    }
}
