//! The protocol trait: the callback bundle bound to a connection.

use std::sync::Arc;

use crate::runtime::Core;
use crate::uuid::Uuid;

/// Verdict returned by [`Protocol::on_shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Close the connection now (pending writes still drain).
    Close,
    /// Delay closure by up to the given seconds (clamped to the grace
    /// budget).
    Delay(u8),
    /// Exclude the connection from the graceful drain; it is force-closed
    /// after everything else.
    Ignore,
}

/// Events that can be forced onto a connection out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Schedule `on_data` (also resumes a suspended connection).
    OnData,
    /// Schedule `on_ready`.
    OnReady,
    /// Schedule `ping`.
    OnTimeout,
}

/// User-supplied callback bundle for one connection.
///
/// A protocol instance should be unique to its connection; shared state
/// belongs behind the instance, not in it. All callbacks receive the
/// connection's [`Uuid`], which survives fd recycling.
///
/// Concurrency: `on_data` is serialized with itself (TASK lock), and
/// `on_ready`/`ping` are serialized with each other (WRITE lock), but a
/// TASK and a WRITE callback may run at the same time on different
/// threads. `on_close` runs exactly once, after every outstanding callback
/// for this attachment has returned.
#[allow(unused_variables)]
pub trait Protocol: Send + Sync + 'static {
    /// Data is available for reading.
    fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {}

    /// The outgoing queue just drained.
    fn on_ready(&self, core: &Arc<Core>, uuid: Uuid) {}

    /// The runtime is shutting down while this connection is open.
    fn on_shutdown(&self, core: &Arc<Core>, uuid: Uuid) -> Shutdown {
        Shutdown::Close
    }

    /// The connection died or the protocol was replaced. Runs once.
    fn on_close(&self, core: &Arc<Core>, uuid: Uuid) {}

    /// The inactivity timeout elapsed. The default closes the connection.
    fn ping(&self, core: &Arc<Core>, uuid: Uuid) {
        core.close(uuid);
    }
}
