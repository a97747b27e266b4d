//! Deferred task queue and timers.
//!
//! The queue is the runtime's spine: reactor threads never invoke user
//! callbacks inline; everything routes through here. Any thread may enqueue
//! (`defer`) and any thread may drain (`perform`). Ordering is FIFO per
//! producer; there is no cross-producer guarantee. Periodic work rides a
//! binary heap of deadlines swept by the reactor between polls.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::metrics;
use crate::runtime::Core;

/// A deferred task. Receives the runtime so that closures need not capture
/// (and cycle-reference) it.
pub(crate) type Task = Box<dyn FnOnce(&Arc<Core>) + Send>;

/// Periodic task body. Returning `false` cancels the timer; `on_finish`
/// still runs.
pub type TimerTask = Box<dyn FnMut(&Arc<Core>) -> bool + Send>;

/// Completion hook for a timer: runs on cancellation, exhaustion, and
/// runtime teardown alike.
pub type TimerFinish = Box<dyn FnOnce(&Arc<Core>) + Send>;

pub(crate) struct TimerEntry {
    fire_at: u64,
    every: u64,
    /// Remaining repetitions; 0 = forever.
    remaining: u64,
    seq: u64,
    task: TimerTask,
    on_finish: Option<TimerFinish>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap pops the earliest deadline first.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

/// MPMC deferred-task queue plus the timer heap.
pub(crate) struct DeferQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    seq: AtomicU64,
}

impl DeferQueue {
    pub(crate) fn new() -> DeferQueue {
        let (tx, rx) = unbounded();
        DeferQueue {
            tx,
            rx,
            timers: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue.
    pub(crate) fn push(&self, task: Task) {
        metrics::DEFER_SCHEDULED.increment();
        // The queue is unbounded and both ends live as long as the Core.
        let _ = self.tx.send(task);
    }

    /// Drain every ready task. Returns the number executed.
    pub(crate) fn perform(&self, core: &Arc<Core>) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.rx.try_recv() {
            task(core);
            executed += 1;
        }
        if executed > 0 {
            metrics::DEFER_EXECUTED.add(executed as u64);
        }
        executed
    }

    /// True if tasks are waiting.
    pub(crate) fn has_queue(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Register a periodic task first firing `every_ms` from `now_ms`.
    pub(crate) fn run_every(
        &self,
        now_ms: u64,
        every_ms: u64,
        repetitions: u64,
        task: TimerTask,
        on_finish: Option<TimerFinish>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.timers.lock().unwrap().push(TimerEntry {
            fire_at: now_ms + every_ms,
            every: every_ms,
            remaining: repetitions,
            seq,
            task,
            on_finish,
        });
    }

    pub(crate) fn reschedule(&self, entry: TimerEntry) {
        self.timers.lock().unwrap().push(entry);
    }

    /// Milliseconds until the next timer deadline, if any.
    pub(crate) fn next_deadline_in(&self, now_ms: u64) -> Option<u64> {
        let timers = self.timers.lock().unwrap();
        timers.peek().map(|e| e.fire_at.saturating_sub(now_ms))
    }

    /// Move every due timer onto the task queue. Each deferred firing runs
    /// the timer body and either reschedules itself or runs `on_finish`.
    pub(crate) fn fire_due(&self, now_ms: u64) {
        loop {
            let entry = {
                let mut timers = self.timers.lock().unwrap();
                match timers.peek() {
                    Some(e) if e.fire_at <= now_ms => timers.pop(),
                    _ => None,
                }
            };
            let Some(mut entry) = entry else { break };
            self.push(Box::new(move |core| {
                metrics::TIMERS_FIRED.increment();
                let keep = (entry.task)(core);
                let exhausted = entry.remaining == 1;
                if keep && !exhausted {
                    if entry.remaining > 0 {
                        entry.remaining -= 1;
                    }
                    entry.fire_at += entry.every;
                    core.defer_queue().reschedule(entry);
                } else if let Some(finish) = entry.on_finish.take() {
                    finish(core);
                }
            }));
        }
    }

    /// Cancel every pending timer, running the completion hooks. Used at
    /// shutdown so `on_finish` fires even for timers that never expired.
    pub(crate) fn drain_timers(&self, core: &Arc<Core>) {
        let entries: Vec<TimerEntry> = {
            let mut timers = self.timers.lock().unwrap();
            std::mem::take(&mut *timers).into_vec()
        };
        for mut entry in entries {
            if let Some(finish) = entry.on_finish.take() {
                finish(core);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_orders_by_deadline() {
        let queue = DeferQueue::new();
        queue.run_every(0, 50, 1, Box::new(|_| true), None);
        queue.run_every(0, 10, 1, Box::new(|_| true), None);
        queue.run_every(0, 30, 1, Box::new(|_| true), None);

        assert_eq!(queue.next_deadline_in(0), Some(10));
        assert_eq!(queue.next_deadline_in(25), Some(0));
    }

    #[test]
    fn fifo_per_producer() {
        // Order is observable without a Core: the channel itself is FIFO.
        let (tx, rx) = unbounded::<u32>();
        for i in 0..100 {
            tx.send(i).unwrap();
        }
        let drained: Vec<u32> = (0..100).map(|_| rx.try_recv().unwrap()).collect();
        assert!(drained.windows(2).all(|w| w[0] < w[1]));
    }
}
