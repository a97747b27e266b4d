//! Runtime metrics.
//!
//! Per-worker counters for connections, bytes, deferred tasks, pub/sub
//! traffic, and cluster frames. Registered with metriken for exposition by
//! whatever admin surface the embedder runs.

use metriken::{Gauge, metric};

use crate::counter::{ShardedCounter, ShardedGroup};

static CONN: ShardedGroup = ShardedGroup::new();
static BYTES: ShardedGroup = ShardedGroup::new();
static DEFER: ShardedGroup = ShardedGroup::new();
static PUBSUB: ShardedGroup = ShardedGroup::new();
static CLUSTER: ShardedGroup = ShardedGroup::new();

/// Slot indices for connection counters.
mod conn {
    pub const OPENED: usize = 0;
    pub const CLOSED: usize = 1;
    pub const TIMEOUTS: usize = 2;
}

/// Slot indices for byte counters.
mod bytes {
    pub const RECEIVED: usize = 0;
    pub const SENT: usize = 1;
}

/// Slot indices for defer-queue counters.
mod defer {
    pub const SCHEDULED: usize = 0;
    pub const EXECUTED: usize = 1;
    pub const TIMERS_FIRED: usize = 2;
}

/// Slot indices for pub/sub counters.
mod pubsub {
    pub const PUBLISHED: usize = 0;
    pub const DELIVERED: usize = 1;
}

/// Slot indices for cluster IPC counters.
mod cluster {
    pub const FRAMES_SENT: usize = 0;
    pub const FRAMES_RECEIVED: usize = 1;
}

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(name = "evline/connections/opened", description = "Connections registered")]
pub static CONNECTIONS_OPENED: ShardedCounter = ShardedCounter::new(&CONN, conn::OPENED);

#[metric(name = "evline/connections/closed", description = "Connections torn down")]
pub static CONNECTIONS_CLOSED: ShardedCounter = ShardedCounter::new(&CONN, conn::CLOSED);

#[metric(
    name = "evline/connections/timeouts",
    description = "Timeout pings dispatched"
)]
pub static CONNECTION_TIMEOUTS: ShardedCounter = ShardedCounter::new(&CONN, conn::TIMEOUTS);

#[metric(name = "evline/connections/active", description = "Currently open connections")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "evline/bytes/received", description = "Bytes read from sockets")]
pub static BYTES_RECEIVED: ShardedCounter = ShardedCounter::new(&BYTES, bytes::RECEIVED);

#[metric(name = "evline/bytes/sent", description = "Bytes written to sockets")]
pub static BYTES_SENT: ShardedCounter = ShardedCounter::new(&BYTES, bytes::SENT);

// ── Defer queue ──────────────────────────────────────────────────

#[metric(name = "evline/defer/scheduled", description = "Tasks enqueued")]
pub static DEFER_SCHEDULED: ShardedCounter = ShardedCounter::new(&DEFER, defer::SCHEDULED);

#[metric(name = "evline/defer/executed", description = "Tasks executed")]
pub static DEFER_EXECUTED: ShardedCounter = ShardedCounter::new(&DEFER, defer::EXECUTED);

#[metric(name = "evline/defer/timers_fired", description = "Timer expirations")]
pub static TIMERS_FIRED: ShardedCounter = ShardedCounter::new(&DEFER, defer::TIMERS_FIRED);

// ── Pub/sub ──────────────────────────────────────────────────────

#[metric(name = "evline/pubsub/published", description = "Messages published")]
pub static MESSAGES_PUBLISHED: ShardedCounter = ShardedCounter::new(&PUBSUB, pubsub::PUBLISHED);

#[metric(
    name = "evline/pubsub/delivered",
    description = "Subscription callbacks invoked"
)]
pub static MESSAGES_DELIVERED: ShardedCounter = ShardedCounter::new(&PUBSUB, pubsub::DELIVERED);

// ── Cluster IPC ──────────────────────────────────────────────────

#[metric(name = "evline/cluster/frames_sent", description = "IPC frames written")]
pub static CLUSTER_FRAMES_SENT: ShardedCounter =
    ShardedCounter::new(&CLUSTER, cluster::FRAMES_SENT);

#[metric(name = "evline/cluster/frames_received", description = "IPC frames read")]
pub static CLUSTER_FRAMES_RECEIVED: ShardedCounter =
    ShardedCounter::new(&CLUSTER, cluster::FRAMES_RECEIVED);
