use std::io;

use thiserror::Error;

/// Errors returned by the evline runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket or pipe.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Stale or out-of-range connection identifier.
    #[error("invalid connection uuid")]
    InvalidUuid,
    /// The operation would block (a protocol lock is busy).
    #[error("operation would block")]
    WouldBlock,
    /// The connection is closed or marked for closure.
    #[error("connection closed")]
    ConnectionClosed,
    /// An internal queue or buffer reached its limit.
    #[error("buffer full")]
    BufferFull,
    /// Parent/worker pipe failure.
    #[error("cluster ipc: {0}")]
    ClusterIpc(String),
    /// Poller setup or operation failed.
    #[error("poller: {0}")]
    Poller(String),
    /// A channel pattern failed to parse.
    #[error("invalid channel pattern")]
    PatternInvalid,
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
    /// System resource limit too low (e.g., RLIMIT_NOFILE).
    #[error("{0}")]
    ResourceLimit(String),
}

impl Error {
    /// Last OS error as an evline error.
    pub(crate) fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}
