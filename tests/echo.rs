//! Integration tests: real TCP connections against a running reactor.
//!
//! Each test builds a core, launches `start()` on a background thread,
//! connects with std sockets, and verifies callback behavior: echo
//! round-trips, timeout pings, suspend/resume, shutdown draining, and
//! exactly-once `on_close`.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evline::{
    Config, ConfigBuilder, ConnectArgs, Core, Event, ListenArgs, Protocol, Uuid,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    ConfigBuilder::new()
        .threads(1)
        .capacity(256)
        .state_log(false)
        .build()
        .unwrap()
}

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn launch(core: &Arc<Core>) -> thread::JoinHandle<()> {
    let core = core.clone();
    thread::spawn(move || {
        core.start().unwrap();
    })
}

fn read_until(stream: &mut TcpStream, want: usize) -> Vec<u8> {
    let mut buf = vec![0u8; want];
    let mut total = 0;
    while total < want {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

// ── Echo protocol ───────────────────────────────────────────────────

struct Echo {
    closes: Arc<AtomicUsize>,
}

impl Protocol for Echo {
    fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
        let mut buf = [0u8; 1024];
        loop {
            match core.read(uuid, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = core.write(uuid, &buf[..n]);
                }
                Err(_) => break,
            }
        }
    }

    fn on_close(&self, _core: &Arc<Core>, _uuid: Uuid) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_round_trip_and_single_close() {
    let core = Core::new(test_config()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let on_close = closes.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            let _ = core.attach(
                uuid,
                Some(Box::new(Echo {
                    closes: on_close.clone(),
                })),
            );
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"HELLO").unwrap();
    let response = read_until(&mut stream, 5);
    assert_eq!(&response, b"HELLO");

    // Closing the client fires exactly one on_close on the server side.
    drop(stream);
    let deadline = Instant::now() + Duration::from_secs(5);
    while closes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    core.stop();
    handle.join().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn echo_large_payload() {
    let core = Core::new(test_config()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let on_close = closes.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            let _ = core.attach(
                uuid,
                Some(Box::new(Echo {
                    closes: on_close.clone(),
                })),
            );
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut writer = stream.try_clone().unwrap();
    let to_send = payload.clone();
    let sender = thread::spawn(move || {
        writer.write_all(&to_send).unwrap();
    });

    let echoed = read_until(&mut stream, payload.len());
    sender.join().unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(echoed, payload);

    core.stop();
    handle.join().unwrap();
}

#[test]
fn timeout_fires_ping_until_touch() {
    struct Pinger {
        pings: Arc<AtomicUsize>,
    }

    impl Protocol for Pinger {
        fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {
            self.pings.fetch_add(1, Ordering::SeqCst);
        }
    }

    let core = Core::new(test_config()).unwrap();
    let pings = Arc::new(AtomicUsize::new(0));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let counter = pings.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            let _ = core.attach(
                uuid,
                Some(Box::new(Pinger {
                    pings: counter.clone(),
                })),
            );
            let _ = core.timeout_set(uuid, 1);
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let stream = TcpStream::connect(&addr).unwrap();
    // Send nothing; the inactivity sweep should ping roughly once per
    // second.
    thread::sleep(Duration::from_millis(3300));
    let observed = pings.load(Ordering::SeqCst);
    assert!(
        (2..=4).contains(&observed),
        "expected ~3 pings, observed {observed}"
    );

    drop(stream);
    core.stop();
    handle.join().unwrap();
}

#[test]
fn suspend_blocks_on_data_until_forced() {
    struct Suspending {
        dispatches: Arc<AtomicUsize>,
    }

    impl Protocol for Suspending {
        fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            while let Ok(n) = core.read(uuid, &mut buf) {
                if n == 0 {
                    break;
                }
            }
            let _ = core.suspend(uuid);
        }
    }

    let core = Core::new(test_config()).unwrap();
    let dispatches = Arc::new(AtomicUsize::new(0));
    let conn = Arc::new(Mutex::new(None));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let counter = dispatches.clone();
    let conn_slot = conn.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            *conn_slot.lock().unwrap() = Some(uuid);
            let _ = core.attach(
                uuid,
                Some(Box::new(Suspending {
                    dispatches: counter.clone(),
                })),
            );
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.write_all(b"first").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dispatches.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(dispatches.load(Ordering::SeqCst), 1);

    // Suspended: further bytes must not trigger on_data.
    stream.write_all(b"second").unwrap();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(dispatches.load(Ordering::SeqCst), 1);

    // force_event(OnData) resumes dispatch.
    let uuid = conn.lock().unwrap().expect("connection captured");
    core.force_event(uuid, Event::OnData);
    let deadline = Instant::now() + Duration::from_secs(5);
    while dispatches.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(dispatches.load(Ordering::SeqCst), 2);

    core.stop();
    handle.join().unwrap();
}

#[test]
fn shutdown_drains_pending_writes() {
    const PAYLOAD: usize = 1024 * 1024;

    struct Firehose {
        closes: Arc<AtomicUsize>,
    }

    impl Protocol for Firehose {
        fn on_close(&self, _core: &Arc<Core>, _uuid: Uuid) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
    }

    let core = Core::new(test_config()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let on_close = closes.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            let _ = core.attach(
                uuid,
                Some(Box::new(Firehose {
                    closes: on_close.clone(),
                })),
            );
            let blob = vec![0xA5u8; PAYLOAD];
            let _ = core.write(uuid, &blob);
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    // Give the accept + queued write a moment, then stop the runtime:
    // the drain must deliver every byte before closing.
    thread::sleep(Duration::from_millis(200));
    core.stop();

    let received = read_until(&mut stream, PAYLOAD);
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == 0xA5));

    handle.join().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn outbound_connect_round_trip() {
    struct Client {
        response: Arc<Mutex<Vec<u8>>>,
    }

    impl Protocol for Client {
        fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
            let mut buf = [0u8; 1024];
            while let Ok(n) = core.read(uuid, &mut buf) {
                if n == 0 {
                    break;
                }
                self.response.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        }
        fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
    }

    let core = Core::new(test_config()).unwrap();
    let closes = Arc::new(AtomicUsize::new(0));
    let response = Arc::new(Mutex::new(Vec::new()));

    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let on_close = closes.clone();
    core.listen(
        ListenArgs::new(port, move |core, uuid| {
            let _ = core.attach(
                uuid,
                Some(Box::new(Echo {
                    closes: on_close.clone(),
                })),
            );
        })
        .address("127.0.0.1"),
    )
    .unwrap();

    let handle = launch(&core);
    wait_for_server(&addr);

    let got = response.clone();
    core.connect(
        ConnectArgs::new("127.0.0.1", port, move |core, uuid| {
            let _ = core.attach(uuid, Some(Box::new(Client { response: got.clone() })));
            let _ = core.write(uuid, b"ping");
        })
        .timeout(5),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if response.lock().unwrap().as_slice() == b"ping" {
            break;
        }
        if Instant::now() >= deadline {
            panic!("no echo received: {:?}", response.lock().unwrap());
        }
        thread::sleep(Duration::from_millis(10));
    }

    core.stop();
    handle.join().unwrap();
}
