//! Multi-process pub/sub: forked workers, parent fan-out.
//!
//! A single test lives in this file on purpose: it forks, and must not
//! share its process with unrelated test threads. One process publishes
//! with sibling scope; every *other* process (and only those) must
//! receive the message.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use evline::{ConfigBuilder, Core, PublishArgs, PublishTarget, StateEvent, SubscribeArgs};

fn scratch_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "evline-cluster-{}-{}",
        unsafe { libc::getpid() },
        name
    ))
}

fn append_line(path: &std::path::Path, line: &str) {
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        // One short write; O_APPEND keeps lines intact across processes.
        let _ = file.write_all(format!("{line}\n").as_bytes());
    }
}

#[test]
fn sibling_publish_reaches_other_processes_only() {
    let out_path = scratch_path("out");
    let marker_path = scratch_path("marker");
    let _ = std::fs::remove_file(&out_path);
    let _ = std::fs::remove_file(&marker_path);

    let core = Core::new(
        ConfigBuilder::new()
            .threads(1)
            .workers(2)
            .capacity(128)
            .state_log(false)
            .shutdown_grace(Duration::from_secs(2))
            .build()
            .unwrap(),
    )
    .unwrap();

    // Subscribed before the fork: master and both workers inherit it.
    let out = out_path.clone();
    core.subscribe(SubscribeArgs::channel("x", move |msg| {
        let pid = unsafe { libc::getpid() };
        append_line(
            &out,
            &format!("{pid} {}", String::from_utf8_lossy(msg.message())),
        );
    }))
    .unwrap()
    .leak();

    // At start, exactly one process wins the marker file and becomes the
    // publisher; it records its pid there.
    let marker = marker_path.clone();
    core.state_callback_add(StateEvent::OnStart, move |core| {
        let claimed = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&marker);
        if let Ok(mut file) = claimed {
            let _ = file.write_all(format!("{}", unsafe { libc::getpid() }).as_bytes());
            let _ = core.run_every(
                400,
                1,
                |core| {
                    core.publish(
                        PublishArgs::new("x", "hello-cluster").target(PublishTarget::Siblings),
                    );
                    true
                },
                None,
            );
        }
    });

    // The master polls for completion and stops the whole tree.
    let out = out_path.clone();
    let started = std::time::Instant::now();
    core.state_callback_add(StateEvent::OnStart, move |core: &Arc<Core>| {
        if !core.is_master() || core.is_worker() {
            return;
        }
        let out = out.clone();
        let _ = core.run_every(
            200,
            0,
            move |core| {
                let lines = std::fs::read_to_string(&out)
                    .map(|s| s.lines().count())
                    .unwrap_or(0);
                if lines >= 2 || started.elapsed() > Duration::from_secs(8) {
                    core.stop();
                    return false;
                }
                true
            },
            None,
        );
    });

    core.start().unwrap();

    let received = std::fs::read_to_string(&out_path).unwrap_or_default();
    let publisher = std::fs::read_to_string(&marker_path).unwrap_or_default();
    let publisher_pid: i32 = publisher.trim().parse().expect("publisher recorded");

    let lines: Vec<&str> = received.lines().collect();
    assert_eq!(
        lines.len(),
        2,
        "expected the two non-publishing processes to deliver, got: {received:?}"
    );
    for line in &lines {
        let mut parts = line.splitn(2, ' ');
        let pid: i32 = parts.next().unwrap().parse().unwrap();
        let body = parts.next().unwrap();
        assert_eq!(body, "hello-cluster");
        assert_ne!(pid, publisher_pid, "publisher must not deliver locally");
    }

    let _ = std::fs::remove_file(&out_path);
    let _ = std::fs::remove_file(&marker_path);
}
