//! Sharded counters for hot-path metrics.
//!
//! Reactor threads bump counters on every event, so each thread writes to
//! its own shard and readers sum across shards. A [`ShardedCounter`] points
//! at one slot of a [`ShardedGroup`] and implements [`metriken::Metric`]
//! for exposition.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters per group. One cache line of u64 slots.
const SLOTS: usize = 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Pin the calling thread to a counter shard. Reactor threads call this on
/// startup so writes from different workers never share a cache line.
pub fn set_thread_shard(id: usize) {
    SHARD.set(id % NUM_SHARDS);
}

#[inline]
fn shard_index() -> usize {
    let id = SHARD.get();
    if id != usize::MAX {
        return id;
    }
    // Threads that never registered hash their TLS slot address.
    SHARD.with(|cell| (cell as *const Cell<usize> as usize >> 6) % NUM_SHARDS)
}

#[repr(C, align(64))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to [`SLOTS`] related counters.
pub struct ShardedGroup {
    shards: [Shard; NUM_SHARDS],
}

impl ShardedGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard { slots: [ZERO; SLOTS] };
        ShardedGroup {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS, "counter slot out of range");
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for ShardedGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot of a [`ShardedGroup`], registrable with metriken.
pub struct ShardedCounter {
    group: &'static ShardedGroup,
    slot: usize,
}

impl ShardedCounter {
    pub const fn new(group: &'static ShardedGroup, slot: usize) -> Self {
        ShardedCounter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Aggregated value across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for ShardedCounter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(ShardedCounter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read() {
        static GROUP: ShardedGroup = ShardedGroup::new();
        let counter = ShardedCounter::new(&GROUP, 0);
        assert_eq!(counter.value(), 0);
        counter.increment();
        counter.add(4);
        assert_eq!(counter.value(), 5);
    }

    #[test]
    fn slots_are_independent(){
        static GROUP: ShardedGroup = ShardedGroup::new();
        let a = ShardedCounter::new(&GROUP, 1);
        let b = ShardedCounter::new(&GROUP, 2);
        a.add(3);
        b.add(9);
        assert_eq!(a.value(), 3);
        assert_eq!(b.value(), 9);
    }

    #[test]
    fn sums_across_threads() {
        use std::sync::Arc;
        use std::thread;

        static GROUP: ShardedGroup = ShardedGroup::new();
        let counter = Arc::new(ShardedCounter::new(&GROUP, 3));

        let handles: Vec<_> = (0..4)
            .map(|shard| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    set_thread_shard(shard);
                    for _ in 0..500 {
                        c.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.value(), 2000);
    }
}
