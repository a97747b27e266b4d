//! Connection read/write hooks.
//!
//! Hooks replace the system calls used to move bytes for one connection —
//! the seam where TLS or any other transport layering plugs in. Hook
//! implementations must never call back into the runtime; doing so from
//! inside the write loop would deadlock on the connection's WRITE lock.

use std::io;

use crate::uuid::Uuid;

/// Pluggable byte transport for a connection.
pub trait RwHooks: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes. `Ok(0)` means EOF; a would-block
    /// condition is reported as `io::ErrorKind::WouldBlock`.
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning the number of bytes accepted.
    fn write(&self, uuid: Uuid, buf: &[u8]) -> io::Result<usize>;

    /// Flush any hook-internal buffer. Returns the number of bytes still
    /// buffered inside the hook (0 when fully flushed).
    fn flush(&self, _uuid: Uuid) -> io::Result<usize> {
        Ok(0)
    }

    /// Close the underlying descriptor and release hook resources.
    fn close(&self, uuid: Uuid) {
        unsafe {
            libc::close(uuid.fd());
        }
    }

    /// True for the system-call hooks; enables the `sendfile` fast path
    /// for file packets.
    fn is_default(&self) -> bool {
        false
    }
}

/// The default hooks: plain `read`/`write`/`close` on the socket fd.
pub struct DefaultHooks;

impl RwHooks for DefaultHooks {
    fn read(&self, uuid: Uuid, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(uuid.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    fn write(&self, uuid: Uuid, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::write(uuid.fd(), buf.as_ptr() as *const libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }

    fn is_default(&self) -> bool {
        true
    }
}

/// Set a socket to non-blocking mode. Called for every accepted and
/// outbound socket before registration.
pub(crate) fn set_non_block(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn default_hooks_round_trip() {
        let (rd, wr) = pipe_pair();
        let hooks = DefaultHooks;

        let wrote = hooks.write(Uuid::new(wr, 0), b"ping").unwrap();
        assert_eq!(wrote, 4);

        let mut buf = [0u8; 8];
        let read = hooks.read(Uuid::new(rd, 0), &mut buf).unwrap();
        assert_eq!(&buf[..read], b"ping");

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn nonblocking_read_would_block() {
        let (rd, wr) = pipe_pair();
        set_non_block(rd).unwrap();

        let hooks = DefaultHooks;
        let mut buf = [0u8; 8];
        let err = hooks.read(Uuid::new(rd, 0), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
