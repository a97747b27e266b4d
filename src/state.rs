//! Lifecycle state callbacks.
//!
//! Embedders hook process lifecycle transitions (startup, fork, shutdown,
//! crashes) by registering callbacks per event. Firing walks a snapshot in
//! reverse registration order, so additions and removals during a firing
//! only affect later firings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::Core;

/// Process lifecycle events, in the order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Once, when the runtime is created.
    OnInitialize,
    /// Before the reactor starts.
    PreStart,
    /// Before each worker fork (parent side).
    BeforeFork,
    /// After each fork, in both parent and child.
    AfterFork,
    /// In a freshly forked worker only.
    InChild,
    /// Each time a worker's reactor starts.
    OnStart,
    /// The reactor ran out of immediate work.
    OnIdle,
    /// The shutdown sequence is beginning.
    OnShutdown,
    /// The reactor finished; cleanup time (every process).
    OnFinish,
    /// A worker exited unexpectedly (fired in the parent).
    OnChildCrash,
    /// The parent vanished (fired in workers).
    OnParentCrash,
    /// The root process is about to return from `start`.
    AtExit,
}

const EVENT_COUNT: usize = 12;

impl StateEvent {
    fn index(self) -> usize {
        match self {
            StateEvent::OnInitialize => 0,
            StateEvent::PreStart => 1,
            StateEvent::BeforeFork => 2,
            StateEvent::AfterFork => 3,
            StateEvent::InChild => 4,
            StateEvent::OnStart => 5,
            StateEvent::OnIdle => 6,
            StateEvent::OnShutdown => 7,
            StateEvent::OnFinish => 8,
            StateEvent::OnChildCrash => 9,
            StateEvent::OnParentCrash => 10,
            StateEvent::AtExit => 11,
        }
    }
}

/// Handle for removing a registered state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type Callback = Arc<dyn Fn(&Arc<Core>) + Send + Sync>;

/// Registry of lifecycle callbacks.
pub(crate) struct StateCallbacks {
    lists: [Mutex<Vec<(u64, Callback)>>; EVENT_COUNT],
    next_id: AtomicU64,
}

impl StateCallbacks {
    pub(crate) fn new() -> StateCallbacks {
        StateCallbacks {
            lists: std::array::from_fn(|_| Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(
        &self,
        event: StateEvent,
        callback: impl Fn(&Arc<Core>) + Send + Sync + 'static,
    ) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lists[event.index()]
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        CallbackId(id)
    }

    pub(crate) fn remove(&self, event: StateEvent, id: CallbackId) -> bool {
        let mut list = self.lists[event.index()].lock().unwrap();
        let before = list.len();
        list.retain(|(entry_id, _)| *entry_id != id.0);
        list.len() != before
    }

    pub(crate) fn clear(&self, event: StateEvent) {
        self.lists[event.index()].lock().unwrap().clear();
    }

    /// Fire all callbacks for `event`, last registered first, against a
    /// snapshot taken before the first invocation.
    pub(crate) fn force(&self, core: &Arc<Core>, event: StateEvent) {
        let snapshot: Vec<Callback> = {
            let list = self.lists[event.index()].lock().unwrap();
            list.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in snapshot.iter().rev() {
            callback(core);
        }
    }
}
