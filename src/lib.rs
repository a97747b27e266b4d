//! evline — an event-driven network reactor for Linux.
//!
//! evline multiplexes large numbers of non-blocking sockets over epoll,
//! binds each connection to a user-supplied [`Protocol`], and drives the
//! callbacks under per-connection lock discipline: `on_data` never
//! re-enters, `on_ready`/`ping` never overlap, and `on_close` fires
//! exactly once. Connections are addressed by generation-counted [`Uuid`]s
//! so a recycled file descriptor can never be reached through a stale
//! handle. A deferred-task queue, timer wheel, and cluster-aware pub/sub
//! layer (fan-out across forked worker processes) ride the same loop.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use evline::{ConfigBuilder, Core, ListenArgs, Protocol, Uuid};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
//!         let mut buf = [0u8; 1024];
//!         while let Ok(n) = core.read(uuid, &mut buf) {
//!             if n == 0 {
//!                 break;
//!             }
//!             let _ = core.write(uuid, &buf[..n]);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), evline::Error> {
//!     let core = Core::new(ConfigBuilder::new().threads(2).build()?)?;
//!     core.listen(ListenArgs::new(3000, |core, uuid| {
//!         let _ = core.attach(uuid, Some(Box::new(Echo)));
//!     }))?;
//!     core.start()
//! }
//! ```
//!
//! # Platform
//!
//! Linux only: the readiness source is epoll (edge-triggered, one-shot)
//! and multi-worker mode uses `fork` with a `socketpair` per worker.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod cluster;
pub(crate) mod conn;
pub(crate) mod counter;
pub(crate) mod defer;
pub(crate) mod listener;
pub(crate) mod metrics;
pub(crate) mod poller;
pub(crate) mod pubsub;
pub(crate) mod reactor;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod packet;
pub mod pattern;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod uuid;

// ── Re-exports: runtime ─────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with `build()` validation.
pub use config::ConfigBuilder;
/// The reactor runtime.
pub use runtime::Core;
/// Handle from [`Core::uuid_link`].
pub use runtime::LinkId;
/// Locked protocol access from [`Core::protocol_try_lock`].
pub use runtime::ProtocolGuard;
/// Timer completion hook for [`Core::run_every`].
pub use defer::TimerFinish;
/// Periodic timer task for [`Core::run_every`].
pub use defer::TimerTask;
/// Runtime errors.
pub use error::Error;

// ── Re-exports: connections ─────────────────────────────────────────

/// Default system-call read/write hooks.
pub use hooks::DefaultHooks;
/// Pluggable byte-transport hooks (the TLS seam).
pub use hooks::RwHooks;
/// Protocol lock selector (TASK / WRITE / STATE).
pub use lock::LockKind;
/// One outbound unit: memory slice or file range.
pub use packet::Packet;
/// Out-of-band IO events for [`Core::force_event`].
pub use protocol::Event;
/// The per-connection callback bundle.
pub use protocol::Protocol;
/// Verdicts for [`Protocol::on_shutdown`].
pub use protocol::Shutdown;
/// Generation-counted connection identifier.
pub use uuid::Uuid;

// ── Re-exports: entry points ────────────────────────────────────────

/// Arguments for [`Core::connect`].
pub use listener::ConnectArgs;
/// Arguments for [`Core::listen`].
pub use listener::ListenArgs;

// ── Re-exports: pub/sub ─────────────────────────────────────────────

/// Pluggable pub/sub transport.
pub use pubsub::Engine;
/// A typed record attached to a message before delivery.
pub use pubsub::Metadata;
/// Metadata callback type.
pub use pubsub::MetadataFn;
/// Handle for unregistering a metadata callback.
pub use pubsub::MetadataId;
/// A published message.
pub use pubsub::Msg;
/// The delivery view handed to `on_message` (supports re-queueing).
pub use pubsub::MsgRef;
/// Arguments for [`Core::publish`].
pub use pubsub::PublishArgs;
/// Delivery scope of a publication.
pub use pubsub::PublishTarget;
/// Arguments for [`Core::subscribe`].
pub use pubsub::SubscribeArgs;
/// Cancel-on-drop subscription handle.
pub use pubsub::SubscriptionHandle;

// ── Re-exports: patterns & lifecycle ────────────────────────────────

/// Channel-matching function type.
pub use pattern::MatchFn;
/// The default segment-glob matcher.
pub use pattern::glob_match;
/// Handle for removing a lifecycle callback.
pub use state::CallbackId;
/// Process lifecycle events.
pub use state::StateEvent;
