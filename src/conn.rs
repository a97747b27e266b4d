//! The fd-indexed connection table.
//!
//! One slot per kernel descriptor, reused across connections. Every open
//! bumps the slot generation, and every operation validates the caller's
//! [`Uuid`] against it, so a handle to a recycled fd is rejected instead of
//! touching the new occupant. Teardown hands the slot's owned resources
//! (protocol, packet queue, lifetime links) back to the caller so that
//! callbacks and deallocation run outside the slot mutex.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::hooks::{DefaultHooks, RwHooks};
use crate::packet::Packet;
use crate::protocol::Protocol;
use crate::uuid::Uuid;

/// Shutdown-drain bookkeeping for one connection.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosePlan {
    /// `on_shutdown` asked for a delayed close at this tick (seconds).
    CloseAt(u64),
    /// `on_shutdown` opted out; force-closed after the graceful drain.
    Excluded,
}

/// Mutable per-slot state, guarded by the slot mutex (the STATE lock's
/// realization). User callbacks and hook calls never run under it.
pub(crate) struct SlotState {
    pub(crate) closing: bool,
    pub(crate) suspended: bool,
    pub(crate) scheduled_ondata: bool,
    pub(crate) scheduled_onready: bool,
    pub(crate) listener: bool,
    pub(crate) protocol: Option<Arc<dyn Protocol>>,
    pub(crate) hooks: Arc<dyn RwHooks>,
    pub(crate) timeout_secs: u8,
    pub(crate) last_active: u64,
    pub(crate) close_plan: Option<ClosePlan>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) packets: VecDeque<Packet>,
    pub(crate) links: Vec<(u64, Box<dyn Any + Send>)>,
}

impl SlotState {
    fn fresh(hooks: Arc<dyn RwHooks>, now: u64) -> SlotState {
        SlotState {
            closing: false,
            suspended: false,
            scheduled_ondata: false,
            scheduled_onready: false,
            listener: false,
            protocol: None,
            hooks,
            timeout_secs: 0,
            last_active: now,
            close_plan: None,
            peer_addr: None,
            packets: VecDeque::new(),
            links: Vec::new(),
        }
    }
}

/// One per-fd slot.
pub(crate) struct Slot {
    pub(crate) generation: AtomicU32,
    pub(crate) open: AtomicBool,
    pub(crate) locks: AtomicU8,
    pub(crate) state: Mutex<SlotState>,
}

impl Slot {
    fn new(hooks: Arc<dyn RwHooks>) -> Slot {
        Slot {
            generation: AtomicU32::new(0),
            open: AtomicBool::new(false),
            locks: AtomicU8::new(0),
            state: Mutex::new(SlotState::fresh(hooks, 0)),
        }
    }

    pub(crate) fn matches(&self, uuid: Uuid) -> bool {
        self.open.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == uuid.generation()
    }
}

/// Resources carried out of a slot at teardown. Dropping this runs every
/// packet deallocator and every lifetime link; the protocol is returned so
/// the caller can schedule `on_close`.
pub(crate) struct Teardown {
    pub(crate) uuid: Uuid,
    pub(crate) protocol: Option<Arc<dyn Protocol>>,
    pub(crate) hooks: Arc<dyn RwHooks>,
    pub(crate) packets: VecDeque<Packet>,
    pub(crate) links: Vec<(u64, Box<dyn Any + Send>)>,
}

/// Fixed-size table of connection slots, indexed by fd.
pub(crate) struct FdTable {
    slots: Box<[Slot]>,
    default_hooks: Arc<dyn RwHooks>,
}

impl FdTable {
    pub(crate) fn new(capacity: u32) -> FdTable {
        let default_hooks: Arc<dyn RwHooks> = Arc::new(DefaultHooks);
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot::new(default_hooks.clone()));
        }
        FdTable {
            slots: slots.into_boxed_slice(),
            default_hooks,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, fd: RawFd) -> Option<&Slot> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    /// Resolve a uuid to its slot, rejecting stale generations.
    pub(crate) fn get(&self, uuid: Uuid) -> Result<&Slot, Error> {
        if !uuid.is_valid() {
            return Err(Error::InvalidUuid);
        }
        let slot = self.slot(uuid.fd()).ok_or(Error::InvalidUuid)?;
        if !slot.matches(uuid) {
            return Err(Error::InvalidUuid);
        }
        Ok(slot)
    }

    /// Claim the slot for a freshly opened fd. If the slot is still marked
    /// open (the fd was closed behind the runtime's back), the previous
    /// occupant's resources are returned for teardown.
    pub(crate) fn open(&self, fd: RawFd, now: u64) -> Result<(Uuid, Option<Teardown>), Error> {
        let slot = self.slot(fd).ok_or(Error::BufferFull)?;
        let mut state = slot.state.lock().unwrap();

        let stale = if slot.open.load(Ordering::Acquire) {
            let old_gen = slot.generation.fetch_add(1, Ordering::AcqRel);
            let old = std::mem::replace(&mut *state, SlotState::fresh(self.default_hooks.clone(), now));
            Some(Teardown {
                uuid: Uuid::new(fd, old_gen),
                protocol: old.protocol,
                hooks: old.hooks,
                packets: old.packets,
                links: old.links,
            })
        } else {
            *state = SlotState::fresh(self.default_hooks.clone(), now);
            slot.generation.fetch_add(1, Ordering::AcqRel);
            None
        };

        slot.locks.store(0, Ordering::Release);
        slot.open.store(true, Ordering::Release);
        let generation = slot.generation.load(Ordering::Acquire);
        drop(state);
        Ok((Uuid::new(fd, generation), stale))
    }

    /// Tear the slot down if `uuid` still owns it. Bumps the generation so
    /// outstanding handles go stale, and returns the owned resources.
    pub(crate) fn teardown(&self, uuid: Uuid) -> Option<Teardown> {
        let slot = self.slot(uuid.fd())?;
        let mut state = slot.state.lock().unwrap();
        if !slot.matches(uuid) {
            return None;
        }
        slot.open.store(false, Ordering::Release);
        slot.generation.fetch_add(1, Ordering::AcqRel);
        let old = std::mem::replace(&mut *state, SlotState::fresh(self.default_hooks.clone(), 0));
        drop(state);
        Some(Teardown {
            uuid,
            protocol: old.protocol,
            hooks: old.hooks,
            packets: old.packets,
            links: old.links,
        })
    }

    /// Run `f` on the slot state after validating the uuid.
    pub(crate) fn with_state<R>(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&mut SlotState) -> R,
    ) -> Result<R, Error> {
        let slot = self.get(uuid)?;
        let mut state = slot.state.lock().unwrap();
        // Re-check under the mutex: teardown also runs under it.
        if !slot.matches(uuid) {
            return Err(Error::InvalidUuid);
        }
        Ok(f(&mut state))
    }

    /// Snapshot of all currently open connections.
    pub(crate) fn open_uuids(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            if slot.open.load(Ordering::Acquire) {
                let generation = slot.generation.load(Ordering::Acquire);
                out.push(Uuid::new(fd as RawFd, generation));
            }
        }
        out
    }

    /// Collect connections whose inactivity budget expired, touching each
    /// so the next sweep does not re-fire before the protocol reacts.
    pub(crate) fn sweep_timeouts(&self, now: u64) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            if !slot.open.load(Ordering::Acquire) {
                continue;
            }
            let mut state = slot.state.lock().unwrap();
            if state.listener || state.closing || state.timeout_secs == 0 {
                continue;
            }
            if state.last_active + state.timeout_secs as u64 <= now {
                state.last_active = now;
                let generation = slot.generation.load(Ordering::Acquire);
                expired.push(Uuid::new(fd as RawFd, generation));
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_open_yields_distinct_uuids() {
        let table = FdTable::new(16);
        let (first, stale) = table.open(5, 0).unwrap();
        assert!(stale.is_none());
        assert!(table.get(first).is_ok());

        table.teardown(first).unwrap();
        assert!(matches!(table.get(first), Err(Error::InvalidUuid)));

        let (second, _) = table.open(5, 0).unwrap();
        assert_ne!(first, second);
        assert!(matches!(table.get(first), Err(Error::InvalidUuid)));
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn reopen_of_live_slot_returns_previous_resources() {
        let table = FdTable::new(16);
        let (first, _) = table.open(3, 0).unwrap();
        table
            .with_state(first, |s| s.packets.push_back(Packet::copy_from(b"x")))
            .unwrap();

        let (second, stale) = table.open(3, 0).unwrap();
        let stale = stale.expect("previous occupant");
        assert_eq!(stale.uuid, first);
        assert_eq!(stale.packets.len(), 1);
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn out_of_range_fd_rejected() {
        let table = FdTable::new(4);
        assert!(table.open(99, 0).is_err());
        assert!(table.slot(-1).is_none());
    }

    #[test]
    fn timeout_sweep_touches() {
        let table = FdTable::new(8);
        let (uuid, _) = table.open(2, 100).unwrap();
        table
            .with_state(uuid, |s| {
                s.timeout_secs = 2;
                s.last_active = 100;
            })
            .unwrap();

        assert!(table.sweep_timeouts(101).is_empty());
        let expired = table.sweep_timeouts(102);
        assert_eq!(expired, vec![uuid]);
        // Touched by the sweep: quiet until another interval passes.
        assert!(table.sweep_timeouts(103).is_empty());
        assert_eq!(table.sweep_timeouts(104), vec![uuid]);
    }
}
