//! Per-connection protocol locks.
//!
//! Each slot carries three independent lock bits acquired with
//! compare-and-swap:
//!
//! * **TASK** — held for `on_data`, deferred connection tasks and
//!   `on_shutdown`; guarantees `on_data` never re-enters for one fd.
//! * **WRITE** — held for `on_ready`, `ping` and the outgoing flush loop.
//! * **STATE** — brief out-of-band metadata access.
//!
//! TASK and WRITE may be held by different threads at the same time, so a
//! protocol's `on_data` and `on_ready` can genuinely run in parallel.
//! Acquisition never blocks: a busy lock means the caller re-defers.

use std::sync::atomic::{AtomicU8, Ordering};

pub(crate) const LOCK_TASK: u8 = 0b001;
pub(crate) const LOCK_WRITE: u8 = 0b010;
pub(crate) const LOCK_STATE: u8 = 0b100;

/// Which lock a caller wants. See [`crate::runtime::Core::protocol_try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Data-mutating connection tasks (`on_data`, deferred io tasks).
    Task,
    /// Write-path tasks (`on_ready`, `ping`, flush).
    Write,
    /// Brief metadata reads.
    State,
}

impl LockKind {
    pub(crate) fn mask(self) -> u8 {
        match self {
            LockKind::Task => LOCK_TASK,
            LockKind::Write => LOCK_WRITE,
            LockKind::State => LOCK_STATE,
        }
    }
}

/// Try to set every bit in `mask`; fails if any is already held.
pub(crate) fn try_acquire(bits: &AtomicU8, mask: u8) -> bool {
    let mut current = bits.load(Ordering::Acquire);
    loop {
        if current & mask != 0 {
            return false;
        }
        match bits.compare_exchange_weak(
            current,
            current | mask,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Release the bits in `mask`. Only the holder may call this.
pub(crate) fn release(bits: &AtomicU8, mask: u8) {
    bits.fetch_and(!mask, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_bits() {
        let bits = AtomicU8::new(0);
        assert!(try_acquire(&bits, LOCK_TASK));
        assert!(try_acquire(&bits, LOCK_WRITE));
        assert!(try_acquire(&bits, LOCK_STATE));
        assert!(!try_acquire(&bits, LOCK_TASK));
        release(&bits, LOCK_TASK);
        assert!(try_acquire(&bits, LOCK_TASK));
    }

    #[test]
    fn combined_mask_all_or_nothing() {
        let bits = AtomicU8::new(0);
        assert!(try_acquire(&bits, LOCK_WRITE));
        assert!(!try_acquire(&bits, LOCK_TASK | LOCK_WRITE));
        // The failed combined attempt must not have claimed TASK.
        assert!(try_acquire(&bits, LOCK_TASK));
    }
}
