//! Listening sockets and outbound connections.
//!
//! A listener is itself a connection in the fd table, driven by an
//! internal protocol whose `on_data` accepts until `EAGAIN`. Outbound
//! connects attach a bootstrap protocol that waits for writability,
//! checks `SO_ERROR`, and hands the live connection to the user's
//! `on_connect`.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::protocol::{Protocol, Shutdown};
use crate::runtime::Core;
use crate::uuid::Uuid;

type OpenCallback = Box<dyn Fn(&Arc<Core>, Uuid) + Send + Sync>;
type LifecycleCallback = Box<dyn FnOnce(&Arc<Core>, Uuid) + Send>;

/// One registered listener: its uuid plus the start callback fired when a
/// worker reactor arms it.
pub(crate) struct ListenerEntry {
    pub(crate) uuid: Uuid,
    pub(crate) on_start: Option<LifecycleCallback>,
}

/// Arguments for [`Core::listen`].
pub struct ListenArgs {
    /// Bind address; `None` binds every interface.
    pub address: Option<String>,
    /// Service port.
    pub port: u16,
    /// Called for every accepted connection; should attach a protocol or
    /// close the uuid.
    pub on_open: OpenCallback,
    /// Called when a worker's reactor starts (once per worker process).
    pub on_start: Option<LifecycleCallback>,
    /// Called when the listener closes at shutdown.
    pub on_finish: Option<LifecycleCallback>,
}

impl ListenArgs {
    pub fn new(port: u16, on_open: impl Fn(&Arc<Core>, Uuid) + Send + Sync + 'static) -> ListenArgs {
        ListenArgs {
            address: None,
            port,
            on_open: Box::new(on_open),
            on_start: None,
            on_finish: None,
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> ListenArgs {
        self.address = Some(address.into());
        self
    }

    pub fn on_start(mut self, callback: impl FnOnce(&Arc<Core>, Uuid) + Send + 'static) -> ListenArgs {
        self.on_start = Some(Box::new(callback));
        self
    }

    pub fn on_finish(mut self, callback: impl FnOnce(&Arc<Core>, Uuid) + Send + 'static) -> ListenArgs {
        self.on_finish = Some(Box::new(callback));
        self
    }
}

/// Arguments for [`Core::connect`].
pub struct ConnectArgs {
    pub address: String,
    pub port: u16,
    /// Called once the connection is established; should attach the real
    /// protocol.
    pub on_connect: LifecycleCallback,
    /// Called if the connection fails or times out.
    pub on_fail: Option<LifecycleCallback>,
    /// Seconds before an unanswered connect is abandoned (0 = none).
    pub timeout: u8,
}

impl ConnectArgs {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        on_connect: impl FnOnce(&Arc<Core>, Uuid) + Send + 'static,
    ) -> ConnectArgs {
        ConnectArgs {
            address: address.into(),
            port,
            on_connect: Box::new(on_connect),
            on_fail: None,
            timeout: 0,
        }
    }

    pub fn on_fail(mut self, callback: impl FnOnce(&Arc<Core>, Uuid) + Send + 'static) -> ConnectArgs {
        self.on_fail = Some(Box::new(callback));
        self
    }

    pub fn timeout(mut self, secs: u8) -> ConnectArgs {
        self.timeout = secs;
        self
    }
}

impl Core {
    /// Set up a listening socket. Accepting starts when the worker
    /// reactor starts; the returned uuid identifies the listener.
    pub fn listen(self: &Arc<Self>, args: ListenArgs) -> Result<Uuid, Error> {
        let bind_to = resolve(args.address.as_deref(), args.port)?;
        let fd = create_listener(bind_to, self.cfg.backlog)?;

        let uuid = match self.open_fd(fd) {
            Ok(uuid) => uuid,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(err);
            }
        };
        let protocol = ListenerProtocol {
            on_open: args.on_open,
            on_finish: Mutex::new(args.on_finish),
            addr: bind_to,
        };
        self.conns.with_state(uuid, |s| {
            s.listener = true;
            s.protocol = Some(Arc::new(protocol));
        })?;
        self.listeners.lock().unwrap().push(ListenerEntry {
            uuid,
            on_start: args.on_start,
        });
        if self.cfg.state_log {
            log::info!("listening on {bind_to}");
        }
        Ok(uuid)
    }

    /// Open an outbound connection. The uuid becomes live when
    /// `on_connect` fires; `on_fail` reports a failed or timed-out
    /// attempt.
    pub fn connect(self: &Arc<Self>, args: ConnectArgs) -> Result<Uuid, Error> {
        let peer = resolve(Some(args.address.as_str()), args.port)?;
        let fd = create_socket(peer)?;

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr_len = socket_addr_to_sockaddr(peer, &mut storage);
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe {
                    libc::close(fd);
                }
                return Err(Error::Io(err));
            }
        }

        let uuid = match self.open_fd(fd) {
            Ok(uuid) => uuid,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(err);
            }
        };
        let protocol = ConnectorProtocol {
            on_connect: Mutex::new(Some(args.on_connect)),
            on_fail: Mutex::new(args.on_fail),
            established: AtomicBool::new(false),
        };
        self.conns.with_state(uuid, |s| {
            s.peer_addr = Some(peer);
            s.protocol = Some(Arc::new(protocol));
        })?;
        if args.timeout > 0 {
            self.timeout_set(uuid, args.timeout)?;
        }
        // Writability signals the connect result.
        self.poller.monitor_write(fd)?;
        Ok(uuid)
    }

    /// Arm every registered listener. Runs at worker start, never in a
    /// multi-process master.
    pub(crate) fn arm_listeners(self: &Arc<Self>) {
        let mut starts: Vec<(Uuid, LifecycleCallback)> = Vec::new();
        {
            let mut listeners = self.listeners.lock().unwrap();
            for entry in listeners.iter_mut() {
                if let Err(err) = self.poller.monitor_read(entry.uuid.fd()) {
                    log::warn!("failed to arm listener {}: {err}", entry.uuid);
                    continue;
                }
                if let Some(on_start) = entry.on_start.take() {
                    starts.push((entry.uuid, on_start));
                }
            }
        }
        for (uuid, on_start) in starts {
            on_start(self, uuid);
        }
    }
}

// ── Internal protocols ─────────────────────────────────────────────

struct ListenerProtocol {
    on_open: OpenCallback,
    on_finish: Mutex<Option<LifecycleCallback>>,
    addr: SocketAddr,
}

impl Protocol for ListenerProtocol {
    fn on_data(&self, core: &Arc<Core>, uuid: Uuid) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut addr_len =
                std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    uuid.fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        // Out of descriptors; retry on the next readiness
                        // edge instead of spinning.
                        log::warn!("accept: descriptor limit reached");
                        return;
                    }
                    _ => {
                        log::warn!("accept failed on {}: {err}", self.addr);
                        return;
                    }
                }
            }

            if core.cfg.tcp_nodelay {
                set_nodelay(fd);
            }

            let conn = match core.open_fd(fd) {
                Ok(conn) => conn,
                Err(_) => {
                    unsafe {
                        libc::close(fd);
                    }
                    continue;
                }
            };
            let peer = sockaddr_to_socket_addr(&storage);
            let timeout = core.cfg.default_timeout;
            let _ = core.conns.with_state(conn, |s| {
                s.peer_addr = peer;
                s.timeout_secs = timeout;
            });
            (self.on_open)(core, conn);
        }
    }

    fn on_shutdown(&self, _core: &Arc<Core>, _uuid: Uuid) -> Shutdown {
        Shutdown::Close
    }

    fn on_close(&self, core: &Arc<Core>, uuid: Uuid) {
        if let Some(on_finish) = self.on_finish.lock().unwrap().take() {
            on_finish(core, uuid);
        }
    }

    fn ping(&self, _core: &Arc<Core>, _uuid: Uuid) {}
}

struct ConnectorProtocol {
    on_connect: Mutex<Option<LifecycleCallback>>,
    on_fail: Mutex<Option<LifecycleCallback>>,
    established: AtomicBool,
}

impl Protocol for ConnectorProtocol {
    fn on_ready(&self, core: &Arc<Core>, uuid: Uuid) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                uuid.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 || err != 0 {
            core.force_close(uuid);
            return;
        }
        self.established.store(true, Ordering::Release);
        let _ = core.timeout_set(uuid, 0);
        if let Some(on_connect) = self.on_connect.lock().unwrap().take() {
            on_connect(core, uuid);
        }
    }

    fn ping(&self, core: &Arc<Core>, uuid: Uuid) {
        // Connect timeout.
        core.force_close(uuid);
    }

    fn on_close(&self, core: &Arc<Core>, uuid: Uuid) {
        if !self.established.load(Ordering::Acquire) {
            if let Some(on_fail) = self.on_fail.lock().unwrap().take() {
                on_fail(core, uuid);
            }
        }
    }
}

// ── Socket helpers ─────────────────────────────────────────────────

fn resolve(address: Option<&str>, port: u16) -> Result<SocketAddr, Error> {
    let host = address.unwrap_or("0.0.0.0");
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::Io(io::Error::other("address resolved to nothing")))
}

fn create_socket(addr: SocketAddr) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::last_os());
    }
    Ok(fd)
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let fd = create_socket(addr)?;

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    Ok(fd)
}

fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Fill a `sockaddr_storage` from a `SocketAddr`; returns the length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` (from accept4) to a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn resolve_defaults_to_any() {
        let addr = resolve(None, 1234).unwrap();
        assert_eq!(addr.port(), 1234);
        assert!(addr.ip().is_unspecified());
    }
}
