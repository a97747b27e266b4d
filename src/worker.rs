//! Process and thread management.
//!
//! `start()` blocks until shutdown. With `workers == 0` the calling
//! process runs the reactor itself. Otherwise the caller becomes the
//! master: it forks the workers (before spawning any thread), keeps one
//! pipe per worker for cluster IPC, reaps and respawns crashed workers,
//! and relays SIGINT/SIGTERM as shutdown frames.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::cluster::{self, MasterPipe, Role, WorkerLink, WorkerPipe};
use crate::error::Error;
use crate::reactor::{reactor_loop, shutdown_drain};
use crate::runtime::{Core, STATUS_FINISHED, STATUS_RUNNING, STATUS_STOPPING};
use crate::state::StateEvent;

/// Set by the signal handler; polled by every reactor loop.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Acquire)
}

extern "C" fn on_terminate_signal(_sig: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_terminate_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_terminate_signal as libc::sighandler_t);
        // Writes to dead sockets surface as EPIPE, not process death.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// True while this worker's parent is still alive.
pub(crate) fn parent_alive(core: &Arc<Core>) -> bool {
    let parent = core.cluster().parent_pid();
    parent == 0 || unsafe { libc::getppid() } == parent
}

impl Core {
    /// Run the reactor. Blocks the calling thread until a stop signal, a
    /// [`Core::stop`] call, or (in workers) a parent shutdown message.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        STOP_REQUESTED.store(false, Ordering::Release);
        ensure_nofile_limit(self.cfg.capacity)?;
        install_signal_handlers();

        self.state_callback_force(StateEvent::PreStart);
        let threads = if self.cfg.threads == 0 {
            num_cpus()
        } else {
            self.cfg.threads
        };

        if self.cfg.state_log {
            log::info!(
                "starting: {} worker(s), {} thread(s), capacity {}",
                self.cfg.workers,
                threads,
                self.capacity()
            );
        }

        if self.cfg.workers == 0 {
            self.cluster().set_role(Role::Single);
            self.cluster().set_parent_pid(unsafe { libc::getpid() });
            worker_runtime(self, None, false, threads);
        } else {
            self.cluster().set_role(Role::Master);
            self.cluster().set_parent_pid(unsafe { libc::getpid() });
            for index in 0..self.cfg.workers {
                spawn_worker(self, index, threads)?;
            }
            master_loop(self, threads);
        }

        self.state_callback_force(StateEvent::AtExit);
        self.status.store(STATUS_FINISHED, Ordering::Release);
        if self.cfg.state_log {
            log::info!("stopped");
        }
        Ok(())
    }
}

// ── Worker runtime ─────────────────────────────────────────────────

/// Run a worker (or single-process) reactor to completion: arm the
/// infrastructure, spin the threads, drain on stop.
fn worker_runtime(core: &Arc<Core>, pipe_fd: Option<RawFd>, forked: bool, threads: usize) {
    if forked {
        // Fresh kernel objects: the epoll instance and wake eventfd must
        // not be shared with the parent.
        if core.poller.reinit().is_err() || core.reset_wake_fd().is_err() {
            log::error!("worker failed to rebuild poller after fork");
            std::process::exit(1);
        }
        drop_inherited_links(core);
        core.state_callback_force(StateEvent::AfterFork);
        core.state_callback_force(StateEvent::InChild);
    } else if core.poller.monitor_wake(core.wake_fd()).is_err() {
        log::error!("failed to register wake eventfd");
        return;
    }

    if let Some(fd) = pipe_fd {
        match attach_worker_pipe(core, fd) {
            Ok(()) => {}
            Err(err) => {
                log::error!("worker could not attach cluster pipe: {err}");
                std::process::exit(1);
            }
        }
    }

    core.status.store(STATUS_RUNNING, Ordering::Release);
    core.arm_listeners();
    core.state_callback_force(StateEvent::OnStart);

    let mut handles = Vec::new();
    for index in 1..threads {
        let core = core.clone();
        let handle = thread::Builder::new()
            .name(format!("evline-worker-{index}"))
            .spawn(move || reactor_loop(&core, index));
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => log::warn!("failed to spawn reactor thread: {err}"),
        }
    }

    reactor_loop(core, 0);

    // Every thread observes STOPPING and exits; the drain runs single
    // threaded after they are gone.
    core.wake();
    for handle in handles {
        core.wake();
        let _ = handle.join();
    }

    shutdown_drain(core);
    core.state_callback_force(StateEvent::OnFinish);
}

fn attach_worker_pipe(core: &Arc<Core>, fd: RawFd) -> Result<(), Error> {
    let uuid = core.open_fd(fd)?;
    core.attach(uuid, Some(Box::new(WorkerPipe::new())))?;
    core.cluster().set_pipe(uuid);
    // The parent's mirror starts empty; replay the channels this process
    // already subscribed to.
    for (channel, pattern) in core.registry().channel_snapshot() {
        core.cluster_announce_subscribe(&channel, pattern, true);
    }
    Ok(())
}

/// In a fresh child: the inherited master-side pipe slots belong to the
/// parent. Drop them without callbacks and close the descriptors.
fn drop_inherited_links(core: &Arc<Core>) {
    let links: Vec<WorkerLink> = core.cluster().links.lock().unwrap().drain(..).collect();
    for link in links {
        if let Some(teardown) = core.conns.teardown(link.uuid) {
            // Suppress on_close: the protocol belongs to the parent's
            // reactor, not this child.
            let _ = teardown.protocol;
        }
        unsafe {
            libc::close(link.uuid.fd());
        }
    }
}

// ── Master: fork, reap, respawn ────────────────────────────────────

fn spawn_worker(core: &Arc<Core>, index: usize, threads: usize) -> Result<(), Error> {
    let mut pair = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            pair.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(Error::last_os());
    }
    let (master_end, worker_end) = (pair[0], pair[1]);

    core.state_callback_force(StateEvent::BeforeFork);
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        unsafe {
            libc::close(master_end);
            libc::close(worker_end);
        }
        return Err(Error::last_os());
    }

    if pid == 0 {
        // Child: sheds the master side of every pipe, becomes a worker,
        // and never returns to the caller.
        unsafe {
            libc::close(master_end);
        }
        core.cluster().set_role(Role::Worker);
        core.cluster().set_parent_pid(unsafe { libc::getppid() });
        worker_runtime(core, Some(worker_end), true, threads);
        core.state_callback_force(StateEvent::AtExit);
        std::process::exit(0);
    }

    // Parent.
    unsafe {
        libc::close(worker_end);
    }
    core.state_callback_force(StateEvent::AfterFork);
    let uuid = core.open_fd(master_end)?;
    core.attach(uuid, Some(Box::new(MasterPipe::new(index))))?;
    core.cluster().links.lock().unwrap().push(WorkerLink {
        index,
        pid,
        uuid,
    });
    if core.cfg.state_log {
        log::info!("worker {index} spawned (pid {pid})");
    }
    Ok(())
}

fn master_loop(core: &Arc<Core>, threads: usize) {
    core.status.store(STATUS_RUNNING, Ordering::Release);
    if core.poller.monitor_wake(core.wake_fd()).is_err() {
        log::error!("failed to register wake eventfd");
    }
    core.state_callback_force(StateEvent::OnStart);

    let mut events = Vec::new();
    while core.status.load(Ordering::Acquire) == STATUS_RUNNING {
        if stop_requested() {
            core.stop();
            break;
        }
        let activity = core.reactor_cycle(&mut events, 500);
        core.note_activity(activity);
        reap_workers(core, threads);
    }

    // Shutdown: tell every worker, give them the grace budget plus
    // headroom, then force the stragglers.
    if core.cfg.state_log {
        log::info!("master: broadcasting shutdown");
    }
    core.status.store(STATUS_STOPPING, Ordering::Release);
    cluster::broadcast_shutdown(core);
    core.flush_all();

    let deadline = core.now_ms() + core.cfg.shutdown_grace.as_millis() as u64 + 2000;
    loop {
        let _ = core.reactor_cycle(&mut events, 100);
        reap_workers(core, threads);
        let alive = core.cluster().links.lock().unwrap().len();
        if alive == 0 {
            break;
        }
        if core.now_ms() >= deadline {
            let links = core.cluster().links.lock().unwrap();
            for link in links.iter() {
                log::warn!("killing unresponsive worker {} (pid {})", link.index, link.pid);
                unsafe {
                    libc::kill(link.pid, libc::SIGKILL);
                }
            }
            break;
        }
    }

    shutdown_drain(core);
    core.state_callback_force(StateEvent::OnFinish);
}

/// Collect exited workers. During a run an exit is a crash: fire the
/// callbacks, scrub the mirror, respawn.
fn reap_workers(core: &Arc<Core>, threads: usize) {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return;
        }

        let link = {
            let mut links = core.cluster().links.lock().unwrap();
            links
                .iter()
                .position(|l| l.pid == pid)
                .map(|pos| links.remove(pos))
        };
        let Some(link) = link else { continue };

        core.cluster().mirror.lock().unwrap().drop_worker(link.index);
        core.force_close(link.uuid);

        if core.status.load(Ordering::Acquire) == STATUS_RUNNING && !stop_requested() {
            log::warn!("worker {} (pid {pid}) exited unexpectedly; respawning", link.index);
            core.state_callback_force(StateEvent::OnChildCrash);
            if let Err(err) = spawn_worker(core, link.index, threads) {
                log::error!("failed to respawn worker {}: {err}", link.index);
            }
        } else if core.cfg.state_log {
            log::info!("worker {} (pid {pid}) exited", link.index);
        }
    }
}

// ── Resource limits ────────────────────────────────────────────────

/// Make sure RLIMIT_NOFILE covers the connection capacity, raising the
/// soft limit when the hard limit allows.
fn ensure_nofile_limit(capacity: u32) -> Result<(), Error> {
    let mut rlim: libc::rlimit = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if rc != 0 {
        return Err(Error::last_os());
    }

    // Headroom for the epoll fd, wake eventfds, cluster pipes, stdio.
    let required = capacity as u64 + 64;
    if rlim.rlim_cur >= required {
        return Ok(());
    }

    if rlim.rlim_max >= required || rlim.rlim_max == libc::RLIM_INFINITY {
        rlim.rlim_cur = if rlim.rlim_max == libc::RLIM_INFINITY {
            required
        } else {
            u64::min(required, rlim.rlim_max)
        };
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if rc != 0 {
            return Err(Error::last_os());
        }
        Ok(())
    } else {
        Err(Error::ResourceLimit(format!(
            "RLIMIT_NOFILE too low: capacity {} needs {} but the hard limit is {}. \
             Raise it with: ulimit -n {}",
            capacity, required, rlim.rlim_max, required
        )))
    }
}

/// Number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_count_positive() {
        assert!(num_cpus() >= 1);
    }

    #[test]
    fn nofile_preflight_small_capacity() {
        // Any sane environment allows a tiny capacity.
        ensure_nofile_limit(64).unwrap();
    }

    #[test]
    fn stop_flag_round_trip() {
        STOP_REQUESTED.store(false, Ordering::Release);
        assert!(!stop_requested());
        on_terminate_signal(libc::SIGTERM);
        assert!(stop_requested());
        STOP_REQUESTED.store(false, Ordering::Release);
    }
}
