//! The reactor cycle.
//!
//! Every reactor thread runs the same loop: drain the defer queue, fire
//! due timers, poll for readiness, translate events into deferred
//! callbacks, and sweep inactivity timeouts once a second. User callbacks
//! are never invoked inline from the poll loop — they always ride the
//! defer queue under the appropriate protocol lock.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::conn::ClosePlan;
use crate::error::Error;
use crate::lock::LockKind;
use crate::metrics;
use crate::poller::PollEvent;
use crate::protocol::Shutdown;
use crate::runtime::{Core, STATUS_RUNNING, epoch_secs};
use crate::state::StateEvent;
use crate::uuid::Uuid;

/// Upper bound on a single poll sleep; keeps the timeout sweep and
/// parent-liveness checks at roughly one-second resolution.
const MAX_POLL_MS: u64 = 1000;

impl Core {
    // ── Event scheduling ─────────────────────────────────────────────

    /// Queue an `on_data` dispatch unless one is already queued or the
    /// connection is suspended.
    pub(crate) fn schedule_on_data(self: &Arc<Self>, uuid: Uuid) {
        let should = self
            .conns
            .with_state(uuid, |s| {
                if s.suspended || s.scheduled_ondata || s.protocol.is_none() {
                    false
                } else {
                    s.scheduled_ondata = true;
                    true
                }
            })
            .unwrap_or(false);
        if should {
            self.defer(move |core| task_on_data(core, uuid));
        }
    }

    /// Queue an `on_ready` dispatch.
    pub(crate) fn schedule_on_ready(self: &Arc<Self>, uuid: Uuid) {
        let should = self
            .conns
            .with_state(uuid, |s| {
                if s.scheduled_onready || s.protocol.is_none() {
                    false
                } else {
                    s.scheduled_onready = true;
                    true
                }
            })
            .unwrap_or(false);
        if should {
            self.defer(move |core| task_on_ready(core, uuid));
        }
    }

    /// Queue a `ping` dispatch (timeout handling).
    pub(crate) fn schedule_ping(self: &Arc<Self>, uuid: Uuid) {
        metrics::CONNECTION_TIMEOUTS.increment();
        self.defer(move |core| task_ping(core, uuid));
    }

    /// Re-arm poller interest for a connection: reads unless suspended,
    /// writes while packets are queued.
    pub(crate) fn rearm(self: &Arc<Self>, uuid: Uuid) {
        let Ok((read, write)) = self.conns.with_state(uuid, |s| {
            (!s.suspended, !s.packets.is_empty())
        }) else {
            return;
        };
        let fd = uuid.fd();
        let result = match (read, write) {
            (true, true) => self.poller.monitor_rw(fd),
            (true, false) => self.poller.monitor_read(fd),
            (false, true) => self.poller.monitor_write(fd),
            (false, false) => return,
        };
        if let Err(err) = result {
            log::debug!("poller re-arm failed for uuid {uuid}: {err}");
        }
    }

    // ── The cycle ────────────────────────────────────────────────────

    /// One reactor iteration. Returns the amount of work observed
    /// (tasks + events); zero means the cycle was idle.
    pub(crate) fn reactor_cycle(
        self: &Arc<Self>,
        events: &mut Vec<PollEvent>,
        poll_cap_ms: u64,
    ) -> usize {
        let mut activity = self.perform();

        let now = epoch_secs();
        self.last_tick.store(now, Ordering::Release);
        let now_ms = self.now_ms();
        self.defer.fire_due(now_ms);

        let timeout = if self.has_queue() {
            0
        } else {
            let cap = u64::min(poll_cap_ms, MAX_POLL_MS);
            self.defer
                .next_deadline_in(now_ms)
                .map_or(cap, |next| u64::min(next, cap))
        };

        events.clear();
        match self.poller.wait(events, timeout as i32) {
            Ok(n) => activity += n,
            Err(err) => log::warn!("poller wait failed: {err}"),
        }

        let wake_fd = self.wake_fd();
        for event in events.iter() {
            if event.fd == wake_fd {
                self.drain_wake();
                continue;
            }
            let Some(uuid) = self.fd2uuid(event.fd) else {
                self.poller.forget(event.fd);
                continue;
            };
            if event.readable {
                self.schedule_on_data(uuid);
            } else if event.hangup {
                self.defer(move |core| core.force_close(uuid));
                continue;
            }
            if event.writable {
                if self.pending(uuid) > 0 {
                    self.defer(move |core| {
                        let _ = core.flush(uuid);
                    });
                } else {
                    self.schedule_on_ready(uuid);
                }
            }
        }

        // Once-per-second bookkeeping: inactivity sweep and (in workers)
        // a parent-liveness check.
        if self.last_sweep.swap(now, Ordering::AcqRel) != now {
            for uuid in self.conns.sweep_timeouts(now) {
                self.schedule_ping(uuid);
            }
        }

        activity
    }

    /// Fire `ON_IDLE` on the running → idle transition.
    pub(crate) fn note_activity(self: &Arc<Self>, activity: usize) {
        if activity > 0 {
            self.idle.store(false, Ordering::Release);
        } else if !self.idle.swap(true, Ordering::AcqRel) {
            self.state.force(self, StateEvent::OnIdle);
        }
    }
}

// ── Deferred dispatch tasks ────────────────────────────────────────

fn task_on_data(core: &Arc<Core>, uuid: Uuid) {
    let suspended = core
        .conns
        .with_state(uuid, |s| {
            s.scheduled_ondata = false;
            s.suspended
        })
        .unwrap_or(true);
    if suspended {
        return;
    }
    match core.protocol_lock_classified(uuid, LockKind::Task) {
        Ok(guard) => {
            guard.on_data(core, uuid);
            drop(guard);
            core.rearm(uuid);
        }
        Err(Error::WouldBlock) => {
            // Busy on another thread; try again after it releases.
            let _ = core.conns.with_state(uuid, |s| s.scheduled_ondata = true);
            core.defer(move |core| task_on_data(core, uuid));
        }
        Err(_) => {}
    }
}

fn task_on_ready(core: &Arc<Core>, uuid: Uuid) {
    let valid = core
        .conns
        .with_state(uuid, |s| {
            s.scheduled_onready = false;
        })
        .is_ok();
    if !valid {
        return;
    }
    match core.protocol_lock_classified(uuid, LockKind::Write) {
        Ok(guard) => {
            guard.on_ready(core, uuid);
        }
        Err(Error::WouldBlock) => {
            let _ = core.conns.with_state(uuid, |s| s.scheduled_onready = true);
            core.defer(move |core| task_on_ready(core, uuid));
        }
        Err(_) => {}
    }
}

fn task_ping(core: &Arc<Core>, uuid: Uuid) {
    match core.protocol_lock_classified(uuid, LockKind::Write) {
        Ok(guard) => {
            guard.ping(core, uuid);
        }
        Err(Error::WouldBlock) => {
            // An active write path counts as liveness; the sweep already
            // reset the inactivity clock.
        }
        Err(Error::ConnectionClosed) => {
            // No protocol attached: nothing to ask, close it.
            core.close(uuid);
        }
        Err(_) => {}
    }
}

// ── Worker loop & shutdown drain ───────────────────────────────────

/// The per-thread reactor loop. Returns when the runtime leaves the
/// RUNNING state.
pub(crate) fn reactor_loop(core: &Arc<Core>, thread_index: usize) {
    crate::counter::set_thread_shard(thread_index);
    let mut events = Vec::new();
    while core.status.load(Ordering::Acquire) == STATUS_RUNNING {
        if crate::worker::stop_requested() {
            core.stop();
            break;
        }
        let activity = core.reactor_cycle(&mut events, MAX_POLL_MS);
        core.note_activity(activity);
        if core.is_worker() && !core.is_master() && !crate::worker::parent_alive(core) {
            log::warn!("parent process vanished");
            core.state.force(core, StateEvent::OnParentCrash);
            core.stop();
        }
    }
}

/// Graceful shutdown of a worker (or single-process) reactor: collect
/// `on_shutdown` verdicts, drain pending writes inside the grace budget,
/// then force-close stragglers — connections that opted out last.
pub(crate) fn shutdown_drain(core: &Arc<Core>) {
    core.state.force(core, StateEvent::OnShutdown);
    if core.cfg.state_log {
        log::info!("shutdown: draining connections");
    }

    // Stop accepting first.
    let listeners: Vec<Uuid> = core
        .listeners
        .lock()
        .unwrap()
        .drain(..)
        .map(|entry| entry.uuid)
        .collect();
    for uuid in listeners {
        core.force_close(uuid);
    }

    let grace_ms = core.cfg.shutdown_grace.as_millis() as u64;
    let grace_secs = core.cfg.shutdown_grace.as_secs().max(1);
    let deadline = core.now_ms() + grace_ms;

    let mut awaiting_verdict = core.conns.open_uuids();
    let mut events = Vec::new();
    loop {
        // Collect on_shutdown verdicts; busy connections are retried.
        awaiting_verdict.retain(|&uuid| {
            match core.protocol_lock_classified(uuid, LockKind::Task) {
                Ok(guard) => {
                    let verdict = guard.on_shutdown(core, uuid);
                    drop(guard);
                    match verdict {
                        Shutdown::Close => core.close(uuid),
                        Shutdown::Delay(secs) => {
                            let delay = u64::min(secs as u64, grace_secs);
                            core.set_close_plan(uuid, ClosePlan::CloseAt(core.last_tick() + delay));
                        }
                        Shutdown::Ignore => core.set_close_plan(uuid, ClosePlan::Excluded),
                    }
                    false
                }
                Err(Error::WouldBlock) => true,
                Err(_) => false,
            }
        });

        let _ = core.reactor_cycle(&mut events, 50);
        core.flush_all();

        // Close connections whose delay elapsed.
        let now = core.last_tick();
        let mut open_remaining = 0usize;
        for uuid in core.conns.open_uuids() {
            match core.close_plan(uuid) {
                Some(ClosePlan::Excluded) => continue,
                Some(ClosePlan::CloseAt(at)) if at <= now => core.close(uuid),
                _ => {}
            }
            open_remaining += 1;
        }

        if open_remaining == 0 && awaiting_verdict.is_empty() && !core.has_queue() {
            break;
        }
        if core.now_ms() >= deadline {
            if core.cfg.state_log {
                log::warn!("shutdown: grace budget exhausted with {open_remaining} open");
            }
            break;
        }
    }

    // Force what's left: cooperative connections first, opt-outs last.
    let mut excluded = Vec::new();
    for uuid in core.conns.open_uuids() {
        if core.close_plan(uuid) == Some(ClosePlan::Excluded) {
            excluded.push(uuid);
        } else {
            core.force_close(uuid);
        }
    }
    core.perform();
    for uuid in excluded {
        core.force_close(uuid);
    }

    // Run the on_close tasks and settle the timer wheel.
    core.perform();
    core.defer.drain_timers(core);
    core.perform();
}
