//! Integration tests: pub/sub, lifecycle callbacks, timers, and packet
//! ownership — driven deterministically by calling `perform()` instead of
//! running reactor threads.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use evline::{
    Config, ConfigBuilder, Core, Error, Metadata, Packet, Protocol, PublishArgs, PublishTarget,
    StateEvent, SubscribeArgs, Uuid,
};

fn test_config() -> Config {
    ConfigBuilder::new()
        .threads(1)
        .capacity(128)
        .state_log(false)
        .build()
        .unwrap()
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

// ── Pub/sub fan-out ─────────────────────────────────────────────────

#[test]
fn fan_out_reaches_every_subscriber() {
    let core = Core::new(test_config()).unwrap();
    let deliveries = Arc::new(Mutex::new(Vec::<(Bytes, Bytes)>::new()));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let sink = deliveries.clone();
        handles.push(
            core.subscribe(SubscribeArgs::channel("metrics.cpu", move |msg| {
                sink.lock()
                    .unwrap()
                    .push((msg.channel().clone(), msg.message().clone()));
            }))
            .unwrap(),
        );
    }
    let sink = deliveries.clone();
    handles.push(
        core.subscribe(SubscribeArgs::pattern("metrics.*", move |msg| {
            sink.lock()
                .unwrap()
                .push((msg.channel().clone(), msg.message().clone()));
        }))
        .unwrap(),
    );

    core.publish(
        PublishArgs::new("metrics.cpu", "87%").target(PublishTarget::Process),
    );
    core.perform();

    let seen = deliveries.lock().unwrap();
    assert_eq!(seen.len(), 4);
    for (channel, message) in seen.iter() {
        assert_eq!(&channel[..], b"metrics.cpu");
        assert_eq!(&message[..], b"87%");
    }
}

#[test]
fn pattern_subscription_scopes_by_segment() {
    let core = Core::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    let _handle = core
        .subscribe(SubscribeArgs::pattern("news.*", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    for channel in ["news.weather", "news.weather.today", "sports.scores"] {
        core.publish(PublishArgs::new(channel, "x").target(PublishTarget::Process));
    }
    core.perform();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn filter_namespace_bypasses_channels() {
    let core = Core::new(test_config()).unwrap();
    let filter_hits = Arc::new(AtomicUsize::new(0));
    let channel_hits = Arc::new(AtomicUsize::new(0));

    let counter = filter_hits.clone();
    let _filter_sub = core
        .subscribe(SubscribeArgs::filter(7, move |msg| {
            assert_eq!(msg.filter(), 7);
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    let counter = channel_hits.clone();
    let _channel_sub = core
        .subscribe(SubscribeArgs::channel("7", move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    core.publish(PublishArgs::new("7", "payload").filter(7));
    core.perform();

    assert_eq!(filter_hits.load(Ordering::SeqCst), 1);
    assert_eq!(channel_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn publish_to_silent_channel_is_noop() {
    let core = Core::new(test_config()).unwrap();
    core.publish(PublishArgs::new("nobody.home", "hello"));
    assert_eq!(core.perform(), 0);
}

#[test]
fn unsubscribe_fires_once_and_stops_delivery() {
    let core = Core::new(test_config()).unwrap();
    let deliveries = Arc::new(AtomicUsize::new(0));
    let unsubscribed = Arc::new(AtomicUsize::new(0));

    let counter = deliveries.clone();
    let bye = unsubscribed.clone();
    let handle = core
        .subscribe(
            SubscribeArgs::channel("updates", move |_msg| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_unsubscribe(move || {
                bye.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    core.publish(PublishArgs::new("updates", "1").target(PublishTarget::Process));
    core.perform();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    handle.cancel();
    core.publish(PublishArgs::new("updates", "2").target(PublishTarget::Process));
    core.perform();

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_subscriptions_are_independent() {
    let core = Core::new(test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let a = hits.clone();
    let first = core
        .subscribe(SubscribeArgs::channel("dup", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    let b = hits.clone();
    let second = core
        .subscribe(SubscribeArgs::channel("dup", move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    core.publish(PublishArgs::new("dup", "x").target(PublishTarget::Process));
    core.perform();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    first.cancel();
    core.publish(PublishArgs::new("dup", "y").target(PublishTarget::Process));
    core.perform();
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    second.cancel();
}

#[test]
fn metadata_attaches_and_is_retrievable() {
    let core = Core::new(test_config()).unwrap();
    let observed = Arc::new(AtomicUsize::new(0));

    let id = core.register_metadata(Arc::new(|_channel, message, _is_json| {
        Some(Metadata {
            type_id: 42,
            value: Box::new(message.len()),
        })
    }));

    let counter = observed.clone();
    let _handle = core
        .subscribe(SubscribeArgs::channel("meta", move |msg| {
            let record = msg.metadata(42).expect("metadata record");
            let len = record.downcast_ref::<usize>().expect("usize record");
            assert_eq!(*len, 5);
            assert!(msg.metadata(999).is_none());
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    core.publish(PublishArgs::new("meta", "12345").target(PublishTarget::Process));
    core.perform();
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    core.unregister_metadata(id);
}

#[test]
fn message_defer_requeues_same_delivery() {
    let core = Core::new(test_config()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let _handle = core
        .subscribe(SubscribeArgs::channel("retry", move |msg| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                msg.defer();
            }
        }))
        .unwrap();

    core.publish(PublishArgs::new("retry", "x").target(PublishTarget::Process));
    core.perform();

    // First attempt deferred, second consumed it.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// ── Lifecycle callbacks ─────────────────────────────────────────────

#[test]
fn state_callbacks_fire_in_reverse_registration_order() {
    let core = Core::new(test_config()).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["A", "B", "C"] {
        let order = order.clone();
        core.state_callback_add(StateEvent::OnStart, move |_core| {
            order.lock().unwrap().push(name);
        });
    }

    core.state_callback_force(StateEvent::OnStart);
    assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
}

#[test]
fn removed_state_callback_does_not_fire() {
    let core = Core::new(test_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let id = core.state_callback_add(StateEvent::OnIdle, move |_core| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(core.state_callback_remove(StateEvent::OnIdle, id));
    core.state_callback_force(StateEvent::OnIdle);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

// ── Timers ──────────────────────────────────────────────────────────

#[test]
fn run_every_repeats_and_finishes() {
    let core = Core::new(test_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let counter = fired.clone();
    let done = finished.clone();
    core.run_every(
        20,
        3,
        move |_core| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        },
        Some(Box::new(move |_core| {
            done.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();

    let handle = {
        let core = core.clone();
        thread::spawn(move || core.start().unwrap())
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !finished.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    core.stop();
    handle.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn cancelled_timer_still_runs_on_finish() {
    let core = Core::new(test_config()).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let counter = fired.clone();
    let done = finished.clone();
    core.run_every(
        20,
        0,
        move |_core| {
            // Cancel on the second firing.
            counter.fetch_add(1, Ordering::SeqCst) == 0
        },
        Some(Box::new(move |_core| {
            done.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();

    let handle = {
        let core = core.clone();
        thread::spawn(move || core.start().unwrap())
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !finished.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    core.stop();
    handle.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert!(finished.load(Ordering::SeqCst));
}

// ── Packet ownership & uuid staleness ───────────────────────────────

struct DropTracker {
    data: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for DropTracker {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for DropTracker {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn write_after_close_errors_and_deallocates_once() {
    let core = Core::new(test_config()).unwrap();
    let (rd, wr) = pipe_pair();
    let uuid = core.open_fd(wr).unwrap();

    core.close(uuid);

    let drops = Arc::new(AtomicUsize::new(0));
    let packet = Packet::from_bytes(Bytes::from_owner(DropTracker {
        data: b"doomed".to_vec(),
        drops: drops.clone(),
    }));
    let err = core.write2(uuid, packet).unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    // Settle the deferred teardown; the slot is gone afterwards.
    core.perform();
    assert!(!core.is_valid(uuid));
    assert!(matches!(
        core.write2(uuid, Packet::copy_from(b"x")),
        Err(Error::InvalidUuid)
    ));

    unsafe {
        libc::close(rd);
    }
}

#[test]
fn stale_uuid_rejected_after_reopen() {
    let core = Core::new(test_config()).unwrap();
    let (rd, wr) = pipe_pair();

    let first = core.open_fd(wr).unwrap();
    core.force_close(first);
    core.perform();

    // A new pipe generally recycles the same descriptor number.
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let second = core.open_fd(fds[1]).unwrap();

    assert_ne!(first, second);
    assert!(!core.is_valid(first));
    assert!(core.is_valid(second));
    assert!(matches!(core.touch(first), Err(Error::InvalidUuid)));

    core.force_close(second);
    core.perform();
    unsafe {
        libc::close(rd);
        libc::close(fds[0]);
    }
}

#[test]
fn uuid_link_runs_on_teardown_and_unlink_rescues() {
    struct LinkProbe {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for LinkProbe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    let core = Core::new(test_config()).unwrap();
    let (rd, wr) = pipe_pair();
    let uuid = core.open_fd(wr).unwrap();

    let dropped = Arc::new(AtomicUsize::new(0));
    let rescued = Arc::new(AtomicUsize::new(0));

    let _kept = core
        .uuid_link(
            uuid,
            Box::new(LinkProbe {
                drops: dropped.clone(),
            }),
        )
        .unwrap();
    let to_rescue = core
        .uuid_link(
            uuid,
            Box::new(LinkProbe {
                drops: rescued.clone(),
            }),
        )
        .unwrap();

    let obj = core.uuid_unlink(uuid, to_rescue).unwrap();
    assert_eq!(rescued.load(Ordering::SeqCst), 0);

    core.force_close(uuid);
    core.perform();
    assert_eq!(dropped.load(Ordering::SeqCst), 1);

    drop(obj);
    assert_eq!(rescued.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(rd);
    }
}

// ── Protocol attachment semantics ───────────────────────────────────

#[test]
fn replacing_protocol_schedules_old_on_close() {
    struct Probe {
        closes: Arc<AtomicUsize>,
    }

    impl Protocol for Probe {
        fn on_close(&self, _core: &Arc<Core>, _uuid: Uuid) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let core = Core::new(test_config()).unwrap();
    let (rd, wr) = pipe_pair();
    let uuid = core.open_fd(wr).unwrap();

    let first_closes = Arc::new(AtomicUsize::new(0));
    let second_closes = Arc::new(AtomicUsize::new(0));

    core.attach(
        uuid,
        Some(Box::new(Probe {
            closes: first_closes.clone(),
        })),
    )
    .unwrap();
    core.attach(
        uuid,
        Some(Box::new(Probe {
            closes: second_closes.clone(),
        })),
    )
    .unwrap();
    core.perform();
    assert_eq!(first_closes.load(Ordering::SeqCst), 1);
    assert_eq!(second_closes.load(Ordering::SeqCst), 0);

    core.force_close(uuid);
    core.perform();
    assert_eq!(first_closes.load(Ordering::SeqCst), 1);
    assert_eq!(second_closes.load(Ordering::SeqCst), 1);

    unsafe {
        libc::close(rd);
    }
}
