//! OS readiness source.
//!
//! A thin wrapper over epoll in edge-triggered one-shot mode: a descriptor
//! that fires goes silent until re-armed with another `monitor_*` call.
//! One-shot delivery is what lets every reactor thread call [`Poller::wait`]
//! on the same instance without duplicate dispatch.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::Error;

/// Maximum events drained per `wait` call.
const WAIT_BATCH: usize = 256;

/// Readiness reported for one descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) hangup: bool,
}

/// Edge-triggered one-shot epoll instance.
pub(crate) struct Poller {
    epfd: AtomicI32,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller, Error> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::Poller(io::Error::last_os_error().to_string()));
        }
        Ok(Poller {
            epfd: AtomicI32::new(epfd),
        })
    }

    /// Rebuild the epoll instance. Required in a forked child: the kernel
    /// object is shared with the parent until replaced. Previously
    /// monitored descriptors must be re-armed by the caller.
    pub(crate) fn reinit(&self) -> Result<(), Error> {
        let fresh = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fresh < 0 {
            return Err(Error::Poller(io::Error::last_os_error().to_string()));
        }
        let old = self.epfd.swap(fresh, Ordering::AcqRel);
        if old >= 0 {
            unsafe {
                libc::close(old);
            }
        }
        Ok(())
    }

    /// Arm `fd` for readability (one-shot).
    pub(crate) fn monitor_read(&self, fd: RawFd) -> Result<(), Error> {
        self.arm(fd, libc::EPOLLIN as u32, true)
    }

    /// Arm `fd` for writability (one-shot).
    pub(crate) fn monitor_write(&self, fd: RawFd) -> Result<(), Error> {
        self.arm(fd, libc::EPOLLOUT as u32, true)
    }

    /// Arm `fd` for both directions (one-shot).
    pub(crate) fn monitor_rw(&self, fd: RawFd) -> Result<(), Error> {
        self.arm(fd, libc::EPOLLIN as u32 | libc::EPOLLOUT as u32, true)
    }

    /// Arm `fd` for readability without one-shot. Used for the wake
    /// eventfd, which every reactor thread should keep observing.
    pub(crate) fn monitor_wake(&self, fd: RawFd) -> Result<(), Error> {
        self.arm(fd, libc::EPOLLIN as u32, false)
    }

    fn arm(&self, fd: RawFd, interest: u32, oneshot: bool) -> Result<(), Error> {
        let mut flags = interest | libc::EPOLLET as u32 | libc::EPOLLRDHUP as u32;
        if oneshot {
            flags |= libc::EPOLLONESHOT as u32;
        }
        let mut ev = libc::epoll_event {
            events: flags,
            u64: fd as u64,
        };
        let epfd = self.epfd.load(Ordering::Acquire);
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
            if rc == 0 {
                return Ok(());
            }
            return Err(Error::Poller(io::Error::last_os_error().to_string()));
        }
        Err(Error::Poller(err.to_string()))
    }

    /// Stop observing `fd` entirely.
    pub(crate) fn forget(&self, fd: RawFd) {
        let epfd = self.epfd.load(Ordering::Acquire);
        unsafe {
            // ENOENT is fine: the fd may never have been armed.
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Block up to `timeout_ms` for readiness events. Appends to `out`
    /// and returns the number of events added. A signal interruption
    /// returns 0.
    pub(crate) fn wait(&self, out: &mut Vec<PollEvent>, timeout_ms: i32) -> Result<usize, Error> {
        let mut raw: [libc::epoll_event; WAIT_BATCH] = unsafe { std::mem::zeroed() };
        let epfd = self.epfd.load(Ordering::Acquire);
        let n = unsafe { libc::epoll_wait(epfd, raw.as_mut_ptr(), WAIT_BATCH as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Poller(err.to_string()));
        }
        for ev in raw.iter().take(n as usize) {
            let bits = ev.events;
            out.push(PollEvent {
                fd: ev.u64 as RawFd,
                readable: bits & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                hangup: bits
                    & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32 | libc::EPOLLERR as u32)
                    != 0,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let epfd = self.epfd.load(Ordering::Acquire);
        if epfd >= 0 {
            unsafe {
                libc::close(epfd);
            }
        }
    }
}
