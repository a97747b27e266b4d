//! Outbound packets.
//!
//! A packet is one unit in a connection's outgoing FIFO: either an
//! in-memory byte range or a file range streamed through `sendfile` (or a
//! bounded copy loop when custom hooks are installed). Ownership transfers
//! to the queue on submission; the payload is released exactly once, on
//! send completion or on slot teardown, whichever comes first.

use std::os::fd::RawFd;

use bytes::Bytes;

/// Bounded chunk size used when a file packet cannot go through `sendfile`
/// (custom read/write hooks installed).
pub(crate) const FILE_CHUNK: usize = 16 * 1024;

/// One outbound unit: an in-memory slice or a file range.
pub struct Packet {
    pub(crate) body: PacketBody,
    pub(crate) urgent: bool,
}

pub(crate) enum PacketBody {
    /// In-memory data; `offset` tracks how much has been written.
    Mem { data: Bytes, offset: usize },
    /// A file range; `offset` advances as data is sent.
    File {
        fd: RawFd,
        offset: u64,
        remaining: u64,
        close_on_done: bool,
    },
}

impl Packet {
    /// Packet from a shared byte buffer. Use [`Bytes::from_owner`] to
    /// observe the release of caller-owned storage.
    pub fn from_bytes(data: Bytes) -> Packet {
        Packet {
            body: PacketBody::Mem { data, offset: 0 },
            urgent: false,
        }
    }

    /// Packet that copies the given slice.
    pub fn copy_from(data: &[u8]) -> Packet {
        Packet::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Packet streaming `len` bytes from `fd` starting at `offset`.
    /// The fd is closed once the range is sent (or the packet is dropped)
    /// unless `close_on_done` is false.
    pub fn from_file(fd: RawFd, offset: u64, len: u64, close_on_done: bool) -> Packet {
        Packet {
            body: PacketBody::File {
                fd,
                offset,
                remaining: len,
                close_on_done,
            },
            urgent: false,
        }
    }

    /// Send ahead of everything except the packet already in transmission.
    pub fn urgent(mut self) -> Packet {
        self.urgent = true;
        self
    }

    /// Bytes left to send.
    pub fn remaining(&self) -> u64 {
        match &self.body {
            PacketBody::Mem { data, offset } => (data.len() - offset) as u64,
            PacketBody::File { remaining, .. } => *remaining,
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let PacketBody::File {
            fd, close_on_done, ..
        } = &self.body
        {
            if *close_on_done {
                unsafe {
                    libc::close(*fd);
                }
            }
        }
        // Mem packets release their Bytes refcount implicitly.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackedBuf {
        data: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl AsRef<[u8]> for TrackedBuf {
        fn as_ref(&self) -> &[u8] {
            &self.data
        }
    }

    impl Drop for TrackedBuf {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn mem_packet_releases_owner_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let buf = TrackedBuf {
            data: b"hello".to_vec(),
            drops: drops.clone(),
        };
        let packet = Packet::from_bytes(Bytes::from_owner(buf));
        assert_eq!(packet.remaining(), 5);
        drop(packet);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn file_packet_closes_fd_on_drop() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let packet = Packet::from_file(fds[0], 0, 10, true);
        drop(packet);
        // The read end is closed; a second close must fail with EBADF.
        let rc = unsafe { libc::close(fds[0]) };
        assert_eq!(rc, -1);
        unsafe {
            libc::close(fds[1]);
        }
    }

    #[test]
    fn urgent_flag() {
        let packet = Packet::copy_from(b"x").urgent();
        assert!(packet.urgent);
        assert_eq!(packet.remaining(), 1);
    }
}
