//! Pub/sub registry.
//!
//! Subscriptions live in three spaces: integer filters (process-local,
//! bypassing channel matching), exact channels (O(1) lookup), and patterns
//! (scanned per publication with their matcher). Deliveries ride the defer
//! queue: each matched subscription owns a private FIFO and a single drain
//! task, which is what serializes `on_message`, preserves per-publisher
//! order, and lets `MsgRef::defer` re-queue a delivery.
//!
//! Engine callbacks (`subscribe`/`unsubscribe`) run inside the registry
//! lock. They must never call pub/sub functions synchronously — defer
//! instead. Debug builds assert on such reentrance.

use std::any::Any;
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::error::Error;
use crate::metrics;
use crate::pattern::{MatchFn, Pattern, glob_match, glob_validate};
use crate::runtime::Core;

// ── Messages ───────────────────────────────────────────────────────

/// A typed record attached to a message by a metadata callback. The
/// record's `Drop` runs after the last delivery completes.
pub struct Metadata {
    /// Identifies the record's actual type to consumers.
    pub type_id: i64,
    /// The record itself.
    pub value: Box<dyn Any + Send + Sync>,
}

/// One published message, shared by reference across deliveries.
pub struct Msg {
    filter: i32,
    channel: Bytes,
    data: Bytes,
    is_json: bool,
    metadata: Vec<Metadata>,
}

impl Msg {
    pub fn filter(&self) -> i32 {
        self.filter
    }

    pub fn channel(&self) -> &Bytes {
        &self.channel
    }

    pub fn message(&self) -> &Bytes {
        &self.data
    }

    pub fn is_json(&self) -> bool {
        self.is_json
    }

    /// Find an attached metadata record by type id.
    pub fn metadata(&self, type_id: i64) -> Option<&(dyn Any + Send + Sync)> {
        self.metadata
            .iter()
            .find(|m| m.type_id == type_id)
            .map(|m| &*m.value)
    }
}

/// The view of a message handed to `on_message`.
pub struct MsgRef<'a> {
    msg: &'a Msg,
    deferred: &'a Cell<bool>,
}

impl<'a> MsgRef<'a> {
    /// Re-queue this delivery: the callback will be called again for the
    /// same message, without counting against any budget.
    pub fn defer(&self) {
        self.deferred.set(true);
    }
}

impl std::ops::Deref for MsgRef<'_> {
    type Target = Msg;

    fn deref(&self) -> &Msg {
        self.msg
    }
}

// ── Subscriptions ──────────────────────────────────────────────────

type OnMessage = Box<dyn Fn(MsgRef<'_>) + Send + Sync>;
type OnUnsubscribe = Box<dyn FnOnce() + Send>;

enum SubKey {
    Filter(i32),
    Channel(Bytes),
    Pattern(Pattern),
}

struct SubQueue {
    pending: VecDeque<Arc<Msg>>,
    scheduled: bool,
}

pub(crate) struct Subscription {
    key: SubKey,
    on_message: OnMessage,
    on_unsubscribe: Mutex<Option<OnUnsubscribe>>,
    cancelled: AtomicBool,
    queue: Mutex<SubQueue>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Exactly once, after the last in-flight delivery released its
        // reference.
        if let Ok(slot) = self.on_unsubscribe.get_mut() {
            if let Some(callback) = slot.take() {
                callback();
            }
        }
    }
}

/// Cancels the subscription when dropped. Call [`leak`](Self::leak) to
/// keep the subscription for the life of the runtime.
pub struct SubscriptionHandle {
    core: Weak<Core>,
    sub: Option<Arc<Subscription>>,
}

impl SubscriptionHandle {
    /// Cancel now. Pending deliveries are dropped; `on_unsubscribe` fires
    /// after any in-flight `on_message` returns.
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    /// Keep the subscription alive without holding the handle.
    pub fn leak(mut self) {
        self.sub = None;
    }

    /// The subscribed channel or pattern bytes (`None` for filters).
    pub fn channel(&self) -> Option<Bytes> {
        match self.sub.as_deref().map(|s| &s.key) {
            Some(SubKey::Channel(name)) => Some(name.clone()),
            Some(SubKey::Pattern(p)) => Some(p.pattern.clone()),
            _ => None,
        }
    }

    fn cancel_inner(&mut self) {
        if let Some(sub) = self.sub.take() {
            if let Some(core) = self.core.upgrade() {
                core.registry().unsubscribe(&core, &sub);
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}

/// Arguments for [`Core::subscribe`].
pub struct SubscribeArgs {
    filter: i32,
    channel: Option<Bytes>,
    matcher: Option<MatchFn>,
    is_pattern: bool,
    on_message: OnMessage,
    on_unsubscribe: Option<OnUnsubscribe>,
}

impl SubscribeArgs {
    /// Subscribe to an exact channel.
    pub fn channel(
        name: impl Into<Bytes>,
        on_message: impl Fn(MsgRef<'_>) + Send + Sync + 'static,
    ) -> SubscribeArgs {
        SubscribeArgs {
            filter: 0,
            channel: Some(name.into()),
            matcher: None,
            is_pattern: false,
            on_message: Box::new(on_message),
            on_unsubscribe: None,
        }
    }

    /// Subscribe to a channel pattern (default segment-glob matcher).
    pub fn pattern(
        pattern: impl Into<Bytes>,
        on_message: impl Fn(MsgRef<'_>) + Send + Sync + 'static,
    ) -> SubscribeArgs {
        SubscribeArgs {
            filter: 0,
            channel: Some(pattern.into()),
            matcher: None,
            is_pattern: true,
            on_message: Box::new(on_message),
            on_unsubscribe: None,
        }
    }

    /// Subscribe to an integer filter (process-local namespace).
    pub fn filter(
        filter: i32,
        on_message: impl Fn(MsgRef<'_>) + Send + Sync + 'static,
    ) -> SubscribeArgs {
        SubscribeArgs {
            filter,
            channel: None,
            matcher: None,
            is_pattern: false,
            on_message: Box::new(on_message),
            on_unsubscribe: None,
        }
    }

    /// Replace the matcher for a pattern subscription. Custom matchers are
    /// process-local: across workers, the parent's mirror always matches
    /// the pattern bytes with the default glob.
    pub fn matcher(mut self, matcher: MatchFn) -> SubscribeArgs {
        self.matcher = Some(matcher);
        self
    }

    /// Callback fired once when the subscription is fully cancelled.
    pub fn on_unsubscribe(mut self, callback: impl FnOnce() + Send + 'static) -> SubscribeArgs {
        self.on_unsubscribe = Some(Box::new(callback));
        self
    }
}

// ── Engines ────────────────────────────────────────────────────────

/// A pluggable pub/sub transport.
///
/// `subscribe` and `unsubscribe` are invoked under the registry lock:
/// calling any pub/sub function from inside them deadlocks — defer the
/// call instead.
pub trait Engine: Send + Sync + 'static {
    /// A channel (or pattern) gained its first subscription.
    fn subscribe(&self, core: &Arc<Core>, channel: &Bytes, pattern: bool);
    /// A channel (or pattern) lost its last subscription.
    fn unsubscribe(&self, core: &Arc<Core>, channel: &Bytes, pattern: bool);
    /// Deliver a message published through this engine.
    fn publish(&self, core: &Arc<Core>, channel: &Bytes, message: &Bytes, is_json: bool);
}

/// Where a publication is delivered.
#[derive(Clone, Default)]
pub enum PublishTarget {
    /// Every process in the cluster, this one included.
    #[default]
    Cluster,
    /// This process only.
    Process,
    /// Every process except this one.
    Siblings,
    /// The parent (root) process only.
    Root,
    /// A custom engine; it is responsible for delivery.
    Engine(Arc<dyn Engine>),
}

/// Arguments for [`Core::publish`].
pub struct PublishArgs {
    pub target: PublishTarget,
    /// Non-zero routes to the integer-filter namespace (process-local).
    pub filter: i32,
    pub channel: Bytes,
    pub message: Bytes,
    pub is_json: bool,
}

impl PublishArgs {
    pub fn new(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> PublishArgs {
        PublishArgs {
            target: PublishTarget::default(),
            filter: 0,
            channel: channel.into(),
            message: message.into(),
            is_json: false,
        }
    }

    pub fn target(mut self, target: PublishTarget) -> PublishArgs {
        self.target = target;
        self
    }

    pub fn filter(mut self, filter: i32) -> PublishArgs {
        self.filter = filter;
        self
    }

    pub fn json(mut self) -> PublishArgs {
        self.is_json = true;
        self
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Metadata callback: may attach one typed record per publication.
pub type MetadataFn = Arc<dyn Fn(&Bytes, &Bytes, bool) -> Option<Metadata> + Send + Sync>;

/// Handle for unregistering a metadata callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataId(u64);

struct PatternEntry {
    pattern: Pattern,
    subs: Vec<Arc<Subscription>>,
}

struct RegistryInner {
    channels: HashMap<Bytes, Vec<Arc<Subscription>>>,
    patterns: Vec<PatternEntry>,
    filters: HashMap<i32, Vec<Arc<Subscription>>>,
    engines: Vec<Arc<dyn Engine>>,
}

pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    metadata_fns: Mutex<Vec<(u64, MetadataFn)>>,
    next_meta_id: AtomicU64,
}

thread_local! {
    /// Set while an engine callback runs under the registry lock.
    static IN_ENGINE_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

fn assert_not_reentrant() {
    debug_assert!(
        !IN_ENGINE_CALLBACK.get(),
        "pub/sub call from inside an engine subscribe/unsubscribe callback; defer it"
    );
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner {
                channels: HashMap::new(),
                patterns: Vec::new(),
                filters: HashMap::new(),
                engines: Vec::new(),
            }),
            metadata_fns: Mutex::new(Vec::new()),
            next_meta_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(
        &self,
        core: &Arc<Core>,
        args: SubscribeArgs,
    ) -> Result<SubscriptionHandle, Error> {
        assert_not_reentrant();

        let key = if args.filter != 0 {
            SubKey::Filter(args.filter)
        } else {
            let name = args.channel.ok_or(Error::PatternInvalid)?;
            if args.is_pattern {
                let default_matcher = args.matcher.is_none();
                let matcher = args.matcher.unwrap_or(glob_match as MatchFn);
                if default_matcher && !glob_validate(&name) {
                    return Err(Error::PatternInvalid);
                }
                SubKey::Pattern(Pattern {
                    pattern: name,
                    matcher,
                })
            } else {
                SubKey::Channel(name)
            }
        };

        let sub = Arc::new(Subscription {
            key,
            on_message: args.on_message,
            on_unsubscribe: Mutex::new(args.on_unsubscribe),
            cancelled: AtomicBool::new(false),
            queue: Mutex::new(SubQueue {
                pending: VecDeque::new(),
                scheduled: false,
            }),
        });

        let mut announce: Option<(Bytes, bool)> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            match &sub.key {
                SubKey::Filter(filter) => {
                    inner.filters.entry(*filter).or_default().push(sub.clone());
                }
                SubKey::Channel(name) => {
                    let list = inner.channels.entry(name.clone()).or_default();
                    if list.is_empty() {
                        announce = Some((name.clone(), false));
                    }
                    list.push(sub.clone());
                }
                SubKey::Pattern(pattern) => {
                    let entry = inner
                        .patterns
                        .iter_mut()
                        .find(|e| e.pattern.pattern == pattern.pattern);
                    match entry {
                        Some(entry) => entry.subs.push(sub.clone()),
                        None => {
                            announce = Some((pattern.pattern.clone(), true));
                            inner.patterns.push(PatternEntry {
                                pattern: pattern.clone(),
                                subs: vec![sub.clone()],
                            });
                        }
                    }
                }
            }
            if let Some((name, pattern)) = &announce {
                let engines = inner.engines.clone();
                IN_ENGINE_CALLBACK.set(true);
                for engine in &engines {
                    engine.subscribe(core, name, *pattern);
                }
                IN_ENGINE_CALLBACK.set(false);
            }
        }

        if let Some((name, pattern)) = announce {
            core.cluster_announce_subscribe(&name, pattern, true);
        }

        Ok(SubscriptionHandle {
            core: Arc::downgrade(core),
            sub: Some(sub),
        })
    }

    pub(crate) fn unsubscribe(&self, core: &Arc<Core>, sub: &Arc<Subscription>) {
        sub.cancelled.store(true, Ordering::Release);

        let mut retire: Option<(Bytes, bool)> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            match &sub.key {
                SubKey::Filter(filter) => {
                    if let Some(list) = inner.filters.get_mut(filter) {
                        list.retain(|s| !Arc::ptr_eq(s, sub));
                        if list.is_empty() {
                            inner.filters.remove(filter);
                        }
                    }
                }
                SubKey::Channel(name) => {
                    if let Some(list) = inner.channels.get_mut(name) {
                        list.retain(|s| !Arc::ptr_eq(s, sub));
                        if list.is_empty() {
                            inner.channels.remove(name);
                            retire = Some((name.clone(), false));
                        }
                    }
                }
                SubKey::Pattern(pattern) => {
                    if let Some(pos) = inner
                        .patterns
                        .iter()
                        .position(|e| e.pattern.pattern == pattern.pattern)
                    {
                        let entry = &mut inner.patterns[pos];
                        entry.subs.retain(|s| !Arc::ptr_eq(s, sub));
                        if entry.subs.is_empty() {
                            inner.patterns.remove(pos);
                            retire = Some((pattern.pattern.clone(), true));
                        }
                    }
                }
            }
            if let Some((name, pattern)) = &retire {
                let engines = inner.engines.clone();
                IN_ENGINE_CALLBACK.set(true);
                for engine in &engines {
                    engine.unsubscribe(core, name, *pattern);
                }
                IN_ENGINE_CALLBACK.set(false);
            }
        }

        if let Some((name, pattern)) = retire {
            core.cluster_announce_subscribe(&name, pattern, false);
        }
    }

    pub(crate) fn publish(&self, core: &Arc<Core>, args: PublishArgs) {
        assert_not_reentrant();
        metrics::MESSAGES_PUBLISHED.increment();

        let PublishArgs {
            target,
            filter,
            channel,
            message,
            is_json,
        } = args;

        // Non-zero filters bypass channel matching and stay in-process.
        if filter != 0 {
            self.deliver_local(core, filter, channel, message, is_json);
            return;
        }

        match target {
            PublishTarget::Process => {
                self.deliver_local(core, 0, channel, message, is_json);
            }
            PublishTarget::Cluster => {
                core.cluster_forward_publish(&channel, &message, is_json, false);
                self.deliver_local(core, 0, channel, message, is_json);
            }
            PublishTarget::Siblings => {
                core.cluster_forward_publish(&channel, &message, is_json, false);
            }
            PublishTarget::Root => {
                if core.is_master() {
                    self.deliver_local(core, 0, channel, message, is_json);
                } else {
                    core.cluster_forward_publish(&channel, &message, is_json, true);
                }
            }
            PublishTarget::Engine(engine) => {
                engine.publish(core, &channel, &message, is_json);
            }
        }
    }

    /// Deliver to local subscriptions. Metadata callbacks run once per
    /// publication, before any delivery.
    pub(crate) fn deliver_local(
        &self,
        core: &Arc<Core>,
        filter: i32,
        channel: Bytes,
        message: Bytes,
        is_json: bool,
    ) {
        let mut metadata = Vec::new();
        if filter == 0 {
            let fns: Vec<MetadataFn> = {
                let registered = self.metadata_fns.lock().unwrap();
                registered.iter().map(|(_, f)| f.clone()).collect()
            };
            for f in fns {
                if let Some(record) = f(&channel, &message, is_json) {
                    metadata.push(record);
                }
            }
        }

        let msg = Arc::new(Msg {
            filter,
            channel,
            data: message,
            is_json,
            metadata,
        });

        let targets: Vec<Arc<Subscription>> = {
            let inner = self.inner.lock().unwrap();
            if filter != 0 {
                inner.filters.get(&filter).cloned().unwrap_or_default()
            } else {
                let mut out = inner
                    .channels
                    .get(&msg.channel)
                    .cloned()
                    .unwrap_or_default();
                for entry in &inner.patterns {
                    if entry.pattern.matches(&msg.channel) {
                        out.extend(entry.subs.iter().cloned());
                    }
                }
                out
            }
        };

        for sub in targets {
            {
                let mut queue = sub.queue.lock().unwrap();
                queue.pending.push_back(msg.clone());
                if queue.scheduled {
                    continue;
                }
                queue.scheduled = true;
            }
            let sub = sub.clone();
            core.defer(move |core| drain_subscription(core, sub));
        }
    }

    // ── Engines ────────────────────────────────────────────────────

    pub(crate) fn attach_engine(&self, core: &Arc<Core>, engine: Arc<dyn Engine>) {
        assert_not_reentrant();
        let mut inner = self.inner.lock().unwrap();
        inner.engines.push(engine.clone());
        replay_channels(core, &inner, &engine);
    }

    pub(crate) fn detach_engine(&self, engine: &Arc<dyn Engine>) {
        let mut inner = self.inner.lock().unwrap();
        inner.engines.retain(|e| !Arc::ptr_eq(e, engine));
    }

    pub(crate) fn engine_is_attached(&self, engine: &Arc<dyn Engine>) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.engines.iter().any(|e| Arc::ptr_eq(e, engine))
    }

    /// Replay `subscribe` for every live channel, e.g. after an engine
    /// reconnected to its backing service.
    pub(crate) fn reattach_engine(&self, core: &Arc<Core>, engine: &Arc<dyn Engine>) {
        let inner = self.inner.lock().unwrap();
        replay_channels(core, &inner, engine);
    }

    /// Snapshot of live channels and patterns, for cluster resubscription.
    pub(crate) fn channel_snapshot(&self) -> Vec<(Bytes, bool)> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<(Bytes, bool)> =
            inner.channels.keys().map(|c| (c.clone(), false)).collect();
        out.extend(
            inner
                .patterns
                .iter()
                .map(|e| (e.pattern.pattern.clone(), true)),
        );
        out
    }

    // ── Metadata ───────────────────────────────────────────────────

    pub(crate) fn register_metadata(&self, callback: MetadataFn) -> MetadataId {
        let id = self.next_meta_id.fetch_add(1, Ordering::Relaxed);
        self.metadata_fns.lock().unwrap().push((id, callback));
        MetadataId(id)
    }

    pub(crate) fn unregister_metadata(&self, id: MetadataId) {
        self.metadata_fns
            .lock()
            .unwrap()
            .retain(|(entry_id, _)| *entry_id != id.0);
    }
}

fn replay_channels(core: &Arc<Core>, inner: &RegistryInner, engine: &Arc<dyn Engine>) {
    IN_ENGINE_CALLBACK.set(true);
    for name in inner.channels.keys() {
        engine.subscribe(core, name, false);
    }
    for entry in &inner.patterns {
        engine.subscribe(core, &entry.pattern.pattern, true);
    }
    IN_ENGINE_CALLBACK.set(false);
}

/// Drain a subscription's pending messages one at a time. The single
/// scheduled drain per subscription is what serializes `on_message`.
fn drain_subscription(core: &Arc<Core>, sub: Arc<Subscription>) {
    loop {
        if sub.cancelled.load(Ordering::Acquire) {
            let mut queue = sub.queue.lock().unwrap();
            queue.pending.clear();
            queue.scheduled = false;
            return;
        }

        let msg = {
            let mut queue = sub.queue.lock().unwrap();
            match queue.pending.pop_front() {
                Some(msg) => msg,
                None => {
                    queue.scheduled = false;
                    return;
                }
            }
        };

        let deferred = Cell::new(false);
        (sub.on_message)(MsgRef {
            msg: msg.as_ref(),
            deferred: &deferred,
        });
        metrics::MESSAGES_DELIVERED.increment();

        if deferred.get() {
            // Same delivery again, after yielding the thread.
            let mut queue = sub.queue.lock().unwrap();
            queue.pending.push_front(msg);
            drop(queue);
            let sub = sub.clone();
            core.defer(move |core| drain_subscription(core, sub));
            return;
        }
    }
}
