//! The runtime object.
//!
//! [`Core`] owns the fd table, poller, defer queue, pub/sub registry,
//! lifecycle callbacks, and cluster state. Connection callbacks receive
//! `&Arc<Core>` and call back into it for reads, writes, defers, and
//! pub/sub. Everything here validates the caller's [`Uuid`] before
//! touching a slot; a stale handle gets [`Error::InvalidUuid`], never a
//! callback on the wrong connection.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::cluster::{self, Cluster, Frame, FrameType, Role};
use crate::config::Config;
use crate::conn::{ClosePlan, FdTable, Teardown};
use crate::defer::{DeferQueue, TimerFinish, TimerTask};
use crate::error::Error;
use crate::hooks::RwHooks;
use crate::lock::{self, LOCK_WRITE, LockKind};
use crate::metrics;
use crate::packet::{FILE_CHUNK, Packet, PacketBody};
use crate::poller::Poller;
use crate::protocol::{Event, Protocol};
use crate::pubsub::{
    Engine, MetadataFn, MetadataId, PublishArgs, Registry, SubscribeArgs, SubscriptionHandle,
};
use crate::state::{CallbackId, StateCallbacks, StateEvent};
use crate::uuid::Uuid;

/// Runtime status.
pub(crate) const STATUS_IDLE: u8 = 0;
pub(crate) const STATUS_RUNNING: u8 = 1;
pub(crate) const STATUS_STOPPING: u8 = 2;
pub(crate) const STATUS_FINISHED: u8 = 3;

/// Handle returned by [`Core::uuid_link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkId(u64);

/// The reactor runtime. Create with [`Core::new`], drive with
/// [`Core::start`] (or manually via `perform`/`flush` in tests and
/// embeddings).
pub struct Core {
    pub(crate) cfg: Config,
    pub(crate) conns: FdTable,
    pub(crate) poller: Poller,
    pub(crate) defer: DeferQueue,
    pub(crate) registry: Registry,
    pub(crate) state: StateCallbacks,
    pub(crate) cluster: Cluster,
    /// Registered listeners, armed at worker start.
    pub(crate) listeners: Mutex<Vec<crate::listener::ListenerEntry>>,
    pub(crate) status: AtomicU8,
    pub(crate) wake_fd: AtomicI32,
    pub(crate) started: Instant,
    pub(crate) last_tick: AtomicU64,
    pub(crate) last_sweep: AtomicU64,
    pub(crate) idle: AtomicBool,
    link_ids: AtomicU64,
}

impl Core {
    /// Build a runtime. Fires `ON_INITIALIZE` once before returning.
    pub fn new(cfg: Config) -> Result<Arc<Core>, Error> {
        cfg.validate()?;
        let poller = Poller::new()?;
        let wake_fd = create_eventfd()?;
        let capacity = cfg.capacity;
        let core = Arc::new(Core {
            cfg,
            conns: FdTable::new(capacity),
            poller,
            defer: DeferQueue::new(),
            registry: Registry::new(),
            state: StateCallbacks::new(),
            cluster: Cluster::new(),
            listeners: Mutex::new(Vec::new()),
            status: AtomicU8::new(STATUS_IDLE),
            wake_fd: AtomicI32::new(wake_fd),
            started: Instant::now(),
            last_tick: AtomicU64::new(epoch_secs()),
            last_sweep: AtomicU64::new(0),
            idle: AtomicBool::new(false),
            link_ids: AtomicU64::new(1),
        });
        core.state.force(&core, StateEvent::OnInitialize);
        Ok(core)
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Per-process connection capacity.
    pub fn capacity(&self) -> usize {
        self.conns.capacity()
    }

    /// The readiness engine compiled in.
    pub fn engine_name(&self) -> &'static str {
        "epoll"
    }

    /// Wall-clock seconds of the last reactor tick.
    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Acquire)
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    /// True in the root process (and in single-process mode).
    pub fn is_master(&self) -> bool {
        self.cluster.role() != Role::Worker
    }

    /// True in worker processes (and in single-process mode).
    pub fn is_worker(&self) -> bool {
        self.cluster.role() != Role::Master
    }

    /// Pid of the root process.
    pub fn parent_pid(&self) -> i32 {
        self.cluster.parent_pid()
    }

    /// Request a graceful stop. Safe from any thread.
    pub fn stop(self: &Arc<Self>) {
        let status = self.status.load(Ordering::Acquire);
        if status == STATUS_RUNNING || status == STATUS_IDLE {
            self.status.store(STATUS_STOPPING, Ordering::Release);
        }
        self.wake();
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub(crate) fn defer_queue(&self) -> &DeferQueue {
        &self.defer
    }

    pub(crate) fn state_callbacks(&self) -> &StateCallbacks {
        &self.state
    }

    // ── Wakeup ───────────────────────────────────────────────────────

    /// Wake one sleeping reactor thread.
    pub(crate) fn wake(&self) {
        let fd = self.wake_fd.load(Ordering::Acquire);
        if fd >= 0 {
            let one: u64 = 1;
            unsafe {
                libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
            }
        }
    }

    /// Drain the wake eventfd counter.
    pub(crate) fn drain_wake(&self) {
        let fd = self.wake_fd.load(Ordering::Acquire);
        if fd >= 0 {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
            }
        }
    }

    /// Replace the wake eventfd (after fork) and register it with the
    /// (freshly re-initialized) poller.
    pub(crate) fn reset_wake_fd(&self) -> Result<(), Error> {
        let old = self.wake_fd.load(Ordering::Acquire);
        if old >= 0 {
            unsafe {
                libc::close(old);
            }
        }
        let fresh = create_eventfd()?;
        self.wake_fd.store(fresh, Ordering::Release);
        self.poller.monitor_wake(fresh)
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd.load(Ordering::Acquire)
    }

    // ── Deferred tasks & timers ──────────────────────────────────────

    /// Defer a task onto the runtime queue. Non-blocking; FIFO per
    /// producer.
    pub fn defer(&self, task: impl FnOnce(&Arc<Core>) + Send + 'static) {
        self.defer.push(Box::new(task));
        self.wake();
    }

    /// Drain all ready deferred tasks on the calling thread.
    pub fn perform(self: &Arc<Self>) -> usize {
        self.defer.perform(self)
    }

    /// True if deferred tasks are waiting.
    pub fn has_queue(&self) -> bool {
        self.defer.has_queue()
    }

    /// Run `task` every `ms` milliseconds, `repetitions` times (0 =
    /// forever). The task returns `false` to cancel. `on_finish` always
    /// runs: on cancellation, exhaustion, or runtime teardown.
    pub fn run_every(
        &self,
        ms: u64,
        repetitions: u64,
        task: impl FnMut(&Arc<Core>) -> bool + Send + 'static,
        on_finish: Option<TimerFinish>,
    ) -> Result<(), Error> {
        if ms == 0 {
            return Err(Error::Config("timer interval must be > 0".into()));
        }
        let task: TimerTask = Box::new(task);
        self.defer.run_every(self.now_ms(), ms, repetitions, task, on_finish);
        self.wake();
        Ok(())
    }

    /// Schedule a protected connection task under the given lock. If the
    /// connection dies first, `fallback` runs instead.
    pub fn defer_io_task(
        self: &Arc<Self>,
        uuid: Uuid,
        kind: LockKind,
        task: impl FnOnce(&Arc<Core>, Uuid, &dyn Protocol) + Send + 'static,
        fallback: Option<Box<dyn FnOnce(&Arc<Core>, Uuid) + Send>>,
    ) {
        let task = Box::new(task);
        self.defer(move |core| run_io_task(core, uuid, kind, task, fallback));
    }

    // ── Slot registration ────────────────────────────────────────────

    /// Register an externally created fd and mint its uuid. The fd is
    /// switched to non-blocking mode.
    pub fn open_fd(self: &Arc<Self>, fd: RawFd) -> Result<Uuid, Error> {
        crate::hooks::set_non_block(fd)?;
        let (uuid, stale) = self.conns.open(fd, self.last_tick())?;
        if let Some(stale) = stale {
            // The kernel recycled this fd behind our back: tear the old
            // occupant down without touching the (new) descriptor.
            self.finish_teardown(stale, false);
        }
        metrics::CONNECTIONS_OPENED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        Ok(uuid)
    }

    /// Attach (or replace) the protocol driving `uuid`. `None` hijacks
    /// the connection out of the reactor's callback flow. A replaced
    /// protocol gets its `on_close` scheduled. On an invalid uuid the new
    /// protocol's `on_close` runs immediately via the defer queue.
    pub fn attach(
        self: &Arc<Self>,
        uuid: Uuid,
        protocol: Option<Box<dyn Protocol>>,
    ) -> Result<(), Error> {
        let fresh: Option<Arc<dyn Protocol>> = protocol.map(Arc::from);
        let swapped = self.conns.with_state(uuid, |s| {
            std::mem::replace(&mut s.protocol, fresh.clone())
        });
        match swapped {
            Ok(old) => {
                if let Some(old) = old {
                    self.schedule_protocol_close(old, uuid);
                }
                if fresh.is_some() {
                    self.touch(uuid)?;
                    self.rearm(uuid);
                } else {
                    self.poller.forget(uuid.fd());
                }
                Ok(())
            }
            Err(err) => {
                if let Some(fresh) = fresh {
                    self.schedule_protocol_close(fresh, uuid);
                }
                Err(err)
            }
        }
    }

    /// Register `fd` and attach in one call.
    pub fn attach_fd(
        self: &Arc<Self>,
        fd: RawFd,
        protocol: Box<dyn Protocol>,
    ) -> Result<Uuid, Error> {
        let uuid = self.open_fd(fd)?;
        self.attach(uuid, Some(protocol))?;
        Ok(uuid)
    }

    /// Active uuid for a registered fd, if any.
    pub fn fd2uuid(&self, fd: RawFd) -> Option<Uuid> {
        let slot = self.conns.slot(fd)?;
        if slot.open.load(Ordering::Acquire) {
            Some(Uuid::new(fd, slot.generation.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    // ── Connection state ─────────────────────────────────────────────

    /// True if the uuid refers to a live, open connection.
    pub fn is_valid(&self, uuid: Uuid) -> bool {
        self.conns.get(uuid).is_ok()
    }

    /// True if the uuid is stale or the connection is marked for closure.
    pub fn is_closed(&self, uuid: Uuid) -> bool {
        self.conns
            .with_state(uuid, |s| s.closing)
            .unwrap_or(true)
    }

    /// Reset the inactivity clock.
    pub fn touch(&self, uuid: Uuid) -> Result<(), Error> {
        let now = self.last_tick();
        self.conns.with_state(uuid, |s| s.last_active = now)
    }

    /// Set the inactivity timeout (seconds; 0 disables).
    pub fn timeout_set(&self, uuid: Uuid, secs: u8) -> Result<(), Error> {
        self.conns.with_state(uuid, |s| s.timeout_secs = secs)
    }

    /// Get the inactivity timeout.
    pub fn timeout_get(&self, uuid: Uuid) -> u8 {
        self.conns.with_state(uuid, |s| s.timeout_secs).unwrap_or(0)
    }

    /// Peer address cached at accept/connect time.
    pub fn peer_addr(&self, uuid: Uuid) -> Option<SocketAddr> {
        self.conns.with_state(uuid, |s| s.peer_addr).ok().flatten()
    }

    /// Stop `on_data` dispatch until [`Core::force_event`] resumes it.
    pub fn suspend(&self, uuid: Uuid) -> Result<(), Error> {
        self.conns.with_state(uuid, |s| s.suspended = true)
    }

    /// Schedule an IO event even if it did not occur. `OnData` also
    /// clears a suspension.
    pub fn force_event(self: &Arc<Self>, uuid: Uuid, event: Event) {
        match event {
            Event::OnData => {
                let _ = self.conns.with_state(uuid, |s| s.suspended = false);
                self.schedule_on_data(uuid);
            }
            Event::OnReady => self.schedule_on_ready(uuid),
            Event::OnTimeout => self.schedule_ping(uuid),
        }
    }

    /// Replace the read/write hooks (the TLS seam).
    pub fn set_hooks(&self, uuid: Uuid, hooks: Arc<dyn RwHooks>) -> Result<(), Error> {
        self.conns.with_state(uuid, |s| s.hooks = hooks)
    }

    /// Tie an object's `Drop` to the connection's lifetime. If the uuid
    /// is already dead the object is dropped immediately.
    pub fn uuid_link(&self, uuid: Uuid, obj: Box<dyn Any + Send>) -> Result<LinkId, Error> {
        let id = LinkId(self.link_ids.fetch_add(1, Ordering::Relaxed));
        self.conns.with_state(uuid, |s| s.links.push((id.0, obj)))?;
        Ok(id)
    }

    /// Reclaim a linked object before the connection dies. Returns
    /// `ConnectionClosed` if the link already ran (or was never made).
    pub fn uuid_unlink(&self, uuid: Uuid, id: LinkId) -> Result<Box<dyn Any + Send>, Error> {
        self.conns
            .with_state(uuid, |s| {
                s.links
                    .iter()
                    .position(|(link_id, _)| *link_id == id.0)
                    .map(|pos| s.links.remove(pos).1)
            })?
            .ok_or(Error::ConnectionClosed)
    }

    // ── Reading ──────────────────────────────────────────────────────

    /// Read through the connection's hooks. `Ok(0)` means no data right
    /// now; EOF force-closes the connection and reports
    /// [`Error::ConnectionClosed`].
    pub fn read(self: &Arc<Self>, uuid: Uuid, buf: &mut [u8]) -> Result<usize, Error> {
        let hooks = self.conns.with_state(uuid, |s| s.hooks.clone())?;
        match hooks.read(uuid, buf) {
            Ok(0) => {
                self.force_close(uuid);
                Err(Error::ConnectionClosed)
            }
            Ok(n) => {
                let _ = self.touch(uuid);
                metrics::BYTES_RECEIVED.add(n as u64);
                Ok(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                self.force_close(uuid);
                Err(Error::Io(err))
            }
        }
    }

    // ── Writing ──────────────────────────────────────────────────────

    /// Queue a packet. Ownership transfers on call: whatever happens, the
    /// packet's payload is released exactly once. Errors mean the packet
    /// was dropped without being sent.
    pub fn write2(self: &Arc<Self>, uuid: Uuid, packet: Packet) -> Result<(), Error> {
        let urgent = packet.urgent;
        let now = self.last_tick();
        self.conns.with_state(uuid, move |s| {
            if s.closing {
                // Packet is dropped on return; dealloc runs here.
                return Err(Error::ConnectionClosed);
            }
            if urgent {
                s.packets.push_front(packet);
            } else {
                s.packets.push_back(packet);
            }
            s.last_active = now;
            Ok(())
        })??;
        self.defer(move |core| flush_task(core, uuid));
        Ok(())
    }

    /// Copy `data` and queue it.
    pub fn write(self: &Arc<Self>, uuid: Uuid, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        self.write2(uuid, Packet::copy_from(data))
    }

    /// Stream `len` bytes of `file_fd` (closing it when done) as one
    /// atomic packet.
    pub fn sendfile_to(
        self: &Arc<Self>,
        uuid: Uuid,
        file_fd: RawFd,
        offset: u64,
        len: u64,
    ) -> Result<(), Error> {
        self.write2(uuid, Packet::from_file(file_fd, offset, len, true))
    }

    /// Packets waiting in the outgoing queue (0 for dead uuids).
    pub fn pending(&self, uuid: Uuid) -> usize {
        self.conns.with_state(uuid, |s| s.packets.len()).unwrap_or(0)
    }

    /// Try to drain the outgoing queue under the WRITE lock.
    ///
    /// `Ok(0)`: fully drained. `Ok(n)`: `n` packets remain (writability
    /// monitoring is armed). `Err(WouldBlock)`: another thread holds the
    /// WRITE lock. Other errors tear the connection down.
    pub fn flush(self: &Arc<Self>, uuid: Uuid) -> Result<usize, Error> {
        let Some(guard) = self.try_write_guard(uuid) else {
            self.conns.get(uuid)?;
            return Err(Error::WouldBlock);
        };
        let hooks = self.conns.with_state(uuid, |s| s.hooks.clone())?;

        let mut wrote = false;
        loop {
            let head = self.conns.with_state(uuid, |s| s.packets.pop_front())?;
            let Some(mut packet) = head else { break };
            match self.write_packet(uuid, &hooks, &mut packet, &mut wrote) {
                WriteOutcome::Done => continue,
                WriteOutcome::Partial => {
                    self.conns
                        .with_state(uuid, move |s| s.packets.push_front(packet))?;
                    drop(guard);
                    self.rearm(uuid);
                    return Ok(self.pending(uuid).max(1));
                }
                WriteOutcome::Fatal => {
                    drop(packet);
                    drop(guard);
                    self.force_close(uuid);
                    return Err(Error::ConnectionClosed);
                }
            }
        }

        // Queue drained; give the hooks a chance to flush internal state.
        if let Ok(n) = hooks.flush(uuid) {
            if n > 0 {
                drop(guard);
                self.rearm(uuid);
                return Ok(1);
            }
        }

        let closing = self.conns.with_state(uuid, |s| s.closing)?;
        drop(guard);
        if closing {
            self.force_close(uuid);
            return Ok(0);
        }
        if wrote {
            self.schedule_on_ready(uuid);
        }
        Ok(0)
    }

    /// Attempt to flush every connection with queued packets.
    pub fn flush_all(self: &Arc<Self>) {
        for uuid in self.conns.open_uuids() {
            if self.pending(uuid) > 0 {
                let _ = self.flush(uuid);
            }
        }
    }

    fn write_packet(
        self: &Arc<Self>,
        uuid: Uuid,
        hooks: &Arc<dyn RwHooks>,
        packet: &mut Packet,
        wrote: &mut bool,
    ) -> WriteOutcome {
        match &mut packet.body {
            PacketBody::Mem { data, offset } => loop {
                if *offset >= data.len() {
                    return WriteOutcome::Done;
                }
                match hooks.write(uuid, &data[*offset..]) {
                    Ok(0) => return WriteOutcome::Partial,
                    Ok(n) => {
                        *offset += n;
                        *wrote = true;
                        metrics::BYTES_SENT.add(n as u64);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        return WriteOutcome::Partial;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => return WriteOutcome::Fatal,
                }
            },
            PacketBody::File {
                fd,
                offset,
                remaining,
                ..
            } => {
                if hooks.is_default() {
                    send_file_direct(uuid, *fd, offset, remaining, wrote)
                } else {
                    send_file_hooked(uuid, hooks, *fd, offset, remaining, wrote)
                }
            }
        }
    }

    // ── Closing ──────────────────────────────────────────────────────

    /// Mark for closure; pending writes drain first, then the connection
    /// is torn down and `on_close` fires.
    pub fn close(self: &Arc<Self>, uuid: Uuid) {
        if self
            .conns
            .with_state(uuid, |s| s.closing = true)
            .is_err()
        {
            return;
        }
        self.defer(move |core| flush_task(core, uuid));
    }

    /// Tear the connection down immediately, abandoning queued packets
    /// (their deallocators still run).
    pub fn force_close(self: &Arc<Self>, uuid: Uuid) {
        let Some(teardown) = self.conns.teardown(uuid) else {
            return;
        };
        self.poller.forget(uuid.fd());
        self.finish_teardown(teardown, true);
    }

    fn finish_teardown(self: &Arc<Self>, teardown: Teardown, close_fd: bool) {
        let Teardown {
            uuid,
            protocol,
            hooks,
            packets,
            links,
        } = teardown;
        if close_fd {
            hooks.close(uuid);
        }
        // Queued packets: deallocators run here, exactly once each.
        drop(packets);
        // Lifetime-linked objects run their Drop now, with high priority.
        drop(links);
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();
        if let Some(protocol) = protocol {
            self.schedule_protocol_close(protocol, uuid);
        }
    }

    /// Defer `on_close`, waiting out any in-flight callback that still
    /// holds a reference to this protocol.
    pub(crate) fn schedule_protocol_close(self: &Arc<Self>, protocol: Arc<dyn Protocol>, uuid: Uuid) {
        self.defer(move |core| run_protocol_close(core, protocol, uuid));
    }

    // ── Protocol locks ───────────────────────────────────────────────

    /// Out-of-task access to a connection's protocol under one of the
    /// three locks. Returns `None` when the lock is busy or the uuid is
    /// dead — defer and retry rather than busy-wait.
    pub fn protocol_try_lock(self: &Arc<Self>, uuid: Uuid, kind: LockKind) -> Option<ProtocolGuard> {
        self.protocol_lock_classified(uuid, kind).ok()
    }

    /// Like [`Core::protocol_try_lock`] but tells busy apart from dead.
    pub(crate) fn protocol_lock_classified(
        self: &Arc<Self>,
        uuid: Uuid,
        kind: LockKind,
    ) -> Result<ProtocolGuard, Error> {
        let slot = self.conns.get(uuid)?;
        let state = slot.state.lock().unwrap();
        if !slot.matches(uuid) {
            return Err(Error::InvalidUuid);
        }
        let Some(protocol) = state.protocol.clone() else {
            return Err(Error::ConnectionClosed);
        };
        if !lock::try_acquire(&slot.locks, kind.mask()) {
            return Err(Error::WouldBlock);
        }
        drop(state);
        Ok(ProtocolGuard {
            core: self.clone(),
            fd: uuid.fd(),
            generation: uuid.generation(),
            mask: kind.mask(),
            protocol,
        })
    }

    pub(crate) fn try_write_guard(self: &Arc<Self>, uuid: Uuid) -> Option<WriteGuard> {
        let slot = self.conns.get(uuid).ok()?;
        let state = slot.state.lock().unwrap();
        if !slot.matches(uuid) {
            return None;
        }
        if !lock::try_acquire(&slot.locks, LOCK_WRITE) {
            return None;
        }
        drop(state);
        Some(WriteGuard {
            core: self.clone(),
            fd: uuid.fd(),
            generation: uuid.generation(),
        })
    }

    pub(crate) fn release_lock(&self, fd: RawFd, generation: u32, mask: u8) {
        if let Some(slot) = self.conns.slot(fd) {
            let _state = slot.state.lock().unwrap();
            if slot.generation.load(Ordering::Acquire) == generation {
                lock::release(&slot.locks, mask);
            }
        }
    }

    // ── Shutdown-drain bookkeeping ───────────────────────────────────

    pub(crate) fn set_close_plan(&self, uuid: Uuid, plan: ClosePlan) {
        let _ = self.conns.with_state(uuid, |s| s.close_plan = Some(plan));
    }

    pub(crate) fn close_plan(&self, uuid: Uuid) -> Option<ClosePlan> {
        self.conns.with_state(uuid, |s| s.close_plan).ok().flatten()
    }

    // ── Pub/sub ──────────────────────────────────────────────────────

    /// Subscribe to a channel, pattern, or integer filter. The returned
    /// handle cancels on drop.
    pub fn subscribe(self: &Arc<Self>, args: SubscribeArgs) -> Result<SubscriptionHandle, Error> {
        self.registry.subscribe(self, args)
    }

    /// Publish a message. Publishing to a silent channel is a no-op
    /// success.
    pub fn publish(self: &Arc<Self>, args: PublishArgs) {
        self.registry.publish(self, args);
    }

    /// Attach a custom pub/sub engine; `subscribe` is replayed for every
    /// live channel.
    pub fn attach_engine(self: &Arc<Self>, engine: Arc<dyn Engine>) {
        self.registry.attach_engine(self, engine);
    }

    /// Detach an engine so it can be dropped safely.
    pub fn detach_engine(&self, engine: &Arc<dyn Engine>) {
        self.registry.detach_engine(engine);
    }

    pub fn engine_is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        self.registry.engine_is_attached(engine)
    }

    /// Replay `subscribe` for every live channel on one engine.
    pub fn reattach_engine(self: &Arc<Self>, engine: &Arc<dyn Engine>) {
        self.registry.reattach_engine(self, engine);
    }

    /// Register a metadata callback, invoked once per publication.
    pub fn register_metadata(&self, callback: MetadataFn) -> MetadataId {
        self.registry.register_metadata(callback)
    }

    pub fn unregister_metadata(&self, id: MetadataId) {
        self.registry.unregister_metadata(id)
    }

    // ── Cluster glue (called from the registry) ──────────────────────

    pub(crate) fn cluster_announce_subscribe(
        self: &Arc<Self>,
        channel: &bytes::Bytes,
        pattern: bool,
        subscribe: bool,
    ) {
        if self.cluster.role() != Role::Worker {
            return;
        }
        let pipe = self.cluster.pipe();
        if !pipe.is_valid() {
            return;
        }
        let ftype = match (pattern, subscribe) {
            (false, true) => FrameType::Subscribe,
            (false, false) => FrameType::Unsubscribe,
            (true, true) => FrameType::PatternSubscribe,
            (true, false) => FrameType::PatternUnsubscribe,
        };
        cluster::send_frame(self, pipe, &Frame::control(ftype, channel.clone()));
    }

    pub(crate) fn cluster_forward_publish(
        self: &Arc<Self>,
        channel: &bytes::Bytes,
        message: &bytes::Bytes,
        is_json: bool,
        root_only: bool,
    ) {
        match self.cluster.role() {
            Role::Single => {}
            Role::Worker => {
                let pipe = self.cluster.pipe();
                if pipe.is_valid() {
                    let frame =
                        Frame::publish(channel.clone(), message.clone(), is_json, root_only);
                    cluster::send_frame(self, pipe, &frame);
                }
            }
            Role::Master => {
                if !root_only {
                    cluster::fan_out(self, channel, message, is_json, None);
                }
            }
        }
    }

    // ── Lifecycle callbacks ──────────────────────────────────────────

    /// Register a lifecycle callback.
    pub fn state_callback_add(
        &self,
        event: StateEvent,
        callback: impl Fn(&Arc<Core>) + Send + Sync + 'static,
    ) -> CallbackId {
        self.state.add(event, callback)
    }

    /// Remove a registered lifecycle callback.
    pub fn state_callback_remove(&self, event: StateEvent, id: CallbackId) -> bool {
        self.state.remove(event, id)
    }

    /// Remove every callback for an event.
    pub fn state_callback_clear(&self, event: StateEvent) {
        self.state.clear(event)
    }

    /// Fire an event's callbacks now, as if it occurred (reverse
    /// registration order).
    pub fn state_callback_force(self: &Arc<Self>, event: StateEvent) {
        self.state.force(self, event)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let fd = self.wake_fd.load(Ordering::Acquire);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

// ── Guards ─────────────────────────────────────────────────────────

/// Locked access to a connection's protocol. Derefs to the protocol;
/// the lock releases on drop, on every exit path.
pub struct ProtocolGuard {
    core: Arc<Core>,
    fd: RawFd,
    generation: u32,
    mask: u8,
    protocol: Arc<dyn Protocol>,
}

impl std::ops::Deref for ProtocolGuard {
    type Target = dyn Protocol;

    fn deref(&self) -> &Self::Target {
        &*self.protocol
    }
}

impl Drop for ProtocolGuard {
    fn drop(&mut self) {
        self.core.release_lock(self.fd, self.generation, self.mask);
    }
}

/// WRITE-lock guard without a protocol (the flush path, which must work
/// on hijacked sockets too).
pub(crate) struct WriteGuard {
    core: Arc<Core>,
    fd: RawFd,
    generation: u32,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.core.release_lock(self.fd, self.generation, LOCK_WRITE);
    }
}

// ── Internal helpers ───────────────────────────────────────────────

enum WriteOutcome {
    Done,
    Partial,
    Fatal,
}

fn send_file_direct(
    uuid: Uuid,
    file_fd: RawFd,
    offset: &mut u64,
    remaining: &mut u64,
    wrote: &mut bool,
) -> WriteOutcome {
    loop {
        if *remaining == 0 {
            return WriteOutcome::Done;
        }
        let mut off = *offset as libc::off_t;
        let chunk = usize::min(*remaining as usize, 1 << 20);
        let n = unsafe { libc::sendfile(uuid.fd(), file_fd, &mut off, chunk) };
        if n > 0 {
            *offset = off as u64;
            *remaining -= n as u64;
            *wrote = true;
            metrics::BYTES_SENT.add(n as u64);
            continue;
        }
        if n == 0 {
            // EOF before the requested range was exhausted.
            *remaining = 0;
            return WriteOutcome::Done;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => return WriteOutcome::Partial,
            Some(libc::EINTR) => continue,
            _ => return WriteOutcome::Fatal,
        }
    }
}

fn send_file_hooked(
    uuid: Uuid,
    hooks: &Arc<dyn RwHooks>,
    file_fd: RawFd,
    offset: &mut u64,
    remaining: &mut u64,
    wrote: &mut bool,
) -> WriteOutcome {
    let mut chunk = [0u8; FILE_CHUNK];
    loop {
        if *remaining == 0 {
            return WriteOutcome::Done;
        }
        let want = usize::min(*remaining as usize, FILE_CHUNK);
        let n = unsafe {
            libc::pread(
                file_fd,
                chunk.as_mut_ptr() as *mut libc::c_void,
                want,
                *offset as libc::off_t,
            )
        };
        if n == 0 {
            *remaining = 0;
            return WriteOutcome::Done;
        }
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return WriteOutcome::Fatal;
        }
        let have = n as usize;
        match hooks.write(uuid, &chunk[..have]) {
            Ok(0) => return WriteOutcome::Partial,
            Ok(written) => {
                *offset += written as u64;
                *remaining -= written as u64;
                *wrote = true;
                metrics::BYTES_SENT.add(written as u64);
                if written < have {
                    return WriteOutcome::Partial;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return WriteOutcome::Partial;
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return WriteOutcome::Fatal,
        }
    }
}

type IoTask = Box<dyn FnOnce(&Arc<Core>, Uuid, &dyn Protocol) + Send>;
type IoFallback = Box<dyn FnOnce(&Arc<Core>, Uuid) + Send>;

fn run_io_task(
    core: &Arc<Core>,
    uuid: Uuid,
    kind: LockKind,
    task: IoTask,
    fallback: Option<IoFallback>,
) {
    match core.protocol_lock_classified(uuid, kind) {
        Ok(guard) => task(core, uuid, &*guard),
        Err(Error::WouldBlock) => {
            core.defer(move |core| run_io_task(core, uuid, kind, task, fallback));
        }
        Err(_) => {
            if let Some(fallback) = fallback {
                fallback(core, uuid);
            }
        }
    }
}

/// Deferred flush that survives losing the WRITE-lock race: the holder
/// may have checked the closing flag before it was set, so give up only
/// when the uuid itself is gone.
pub(crate) fn flush_task(core: &Arc<Core>, uuid: Uuid) {
    if let Err(Error::WouldBlock) = core.flush(uuid) {
        core.defer(move |core| flush_task(core, uuid));
    }
}

fn run_protocol_close(core: &Arc<Core>, protocol: Arc<dyn Protocol>, uuid: Uuid) {
    // A strong count above one means a callback still holds a guard on
    // this protocol; `on_close` must wait it out.
    if Arc::strong_count(&protocol) > 1 {
        core.defer(move |core| run_protocol_close(core, protocol, uuid));
        return;
    }
    protocol.on_close(core, uuid);
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn create_eventfd() -> Result<RawFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    Ok(fd)
}
