//! Thin wrapper over the Linux epoll readiness facility.
//!
//! The caller owns the preallocated event vector (see [`event_buffer`]);
//! `wait` fills it and returns the ready count. Registration errors surface
//! as `Err` so the reactor can decide what is fatal — a failed listener
//! registration aborts startup, a failed connection registration just drops
//! that connection.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::EmberResult;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Default capacity of the caller-owned event vector.
pub const MAX_EVENTS: usize = 1024;

/// Allocate the event vector `wait` fills.
pub fn event_buffer(capacity: usize) -> Vec<libc::epoll_event> {
    vec![libc::epoll_event { events: 0, u64: 0 }; capacity]
}

pub struct Epoller {
    fd: RawFd,
}

impl Epoller {
    pub fn new() -> EmberResult<Self> {
        let fd = unsafe { libc::epoll_create1(0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub fn add_fd(&self, fd: RawFd, events: u32) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn mod_fd(&self, fd: RawFd, events: u32) -> EmberResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn del_fd(&self, fd: RawFd) -> EmberResult<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // already gone; deletion is allowed to race with close paths
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (-1 blocks). Returns the ready count; 0 on
    /// timeout. EINTR is reported as a spurious zero-event wakeup.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> usize {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                crate::log_error!("epoll_wait failed: {}", err);
            }
            return 0;
        }
        res as usize
    }

    pub fn event_fd(event: &libc::epoll_event) -> RawFd {
        event.u64 as RawFd
    }

    pub fn event_mask(event: &libc::epoll_event) -> u32 {
        event.events
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> EmberResult<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) };
        if res < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_readiness_round_trip() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let epoller = Epoller::new().unwrap();
        epoller.add_fd(read_fd, EV_IN).unwrap();

        let mut events = event_buffer(8);
        // nothing readable yet: timeout path
        assert_eq!(epoller.wait(&mut events, 0), 0);

        assert_eq!(
            unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        let n = epoller.wait(&mut events, 100);
        assert_eq!(n, 1);
        assert_eq!(Epoller::event_fd(&events[0]), read_fd);
        assert_ne!(Epoller::event_mask(&events[0]) & EV_IN, 0);

        // re-registering an existing fd is an error surfaced to the caller
        assert!(epoller.add_fd(read_fd, EV_IN).is_err());
        epoller.del_fd(read_fd).unwrap();
        // deleting twice is tolerated
        epoller.del_fd(read_fd).unwrap();

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
