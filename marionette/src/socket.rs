//! Listener sockets: spec parsing, creation, options and handoff across re-exec.
//!
//! A listener set is keyed by a symbolic name. The `default` key is the
//! unnamed primary set; named keys let pools bind distinct sockets.
//!
//! Across a re-exec, the master encodes every listener as `key|fd` and joins
//! the pairs with commas in `MARIONETTE_FD`. The successor rebuilds its
//! listeners from that variable and creates nothing new when it is present.

use crate::error::{MasterError, MasterResult};
use marionette_common::config::SocketSection;
use marionette_common::consts::{DEFAULT_LISTENER_KEY, DEFAULT_SERVICE_HOST};
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSpec {
    /// TCP address.
    Tcp(SocketAddr),
    /// Unix socket path.
    Unix(PathBuf),
}

impl FromStr for ListenerSpec {
    type Err = MasterError;

    /// Accepts `host:port`, a bare port (bound on 127.0.0.1) or an absolute path.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let invalid = || MasterError::InvalidListenerSpec {
            spec: spec.to_string(),
        };

        if spec.starts_with('/') {
            return Ok(ListenerSpec::Unix(PathBuf::from(spec)));
        }
        if let Ok(port) = spec.parse::<u16>() {
            return format!("{DEFAULT_SERVICE_HOST}:{port}").parse().map(ListenerSpec::Tcp).map_err(|_| invalid());
        }

        let (host, port) = spec.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = match host {
            "" | "*" => "0.0.0.0",
            h => h,
        };
        (host, port)
            .to_socket_addrs()
            .map_err(|_| invalid())?
            .next()
            .map(ListenerSpec::Tcp)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerSpec::Tcp(addr) => write!(f, "{addr}"),
            ListenerSpec::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One bound, listening socket.
#[derive(Debug)]
pub struct Listener {
    key: String,
    socket: Socket,
}

impl Listener {
    /// Create, configure, bind and listen.
    pub fn bind(key: &str, spec: &ListenerSpec, opts: &SocketSection) -> MasterResult<Self> {
        let socket = match spec {
            ListenerSpec::Tcp(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
                socket.set_reuse_address(true)?;
                socket.bind(&SockAddr::from(*addr))?;
                socket
            }
            ListenerSpec::Unix(path) => {
                remove_stale_socket(path)?;
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.bind(&SockAddr::unix(path)?)?;
                // Open to any local client regardless of umask.
                fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
                socket
            }
        };
        apply_socket_options(&socket, spec, opts)?;
        socket.listen(opts.backlog)?;
        socket.set_cloexec(true)?;

        let listener = Self {
            key: key.to_string(),
            socket,
        };
        info!("listening on addr={} key={key}", sock_name(&listener));
        Ok(listener)
    }

    /// Adopt an inherited descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be open and owned by nobody else in this process.
    unsafe fn from_inherited(key: &str, fd: RawFd) -> io::Result<Self> {
        // SAFETY: the caller guarantees `fd` is open for the duration of the check.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        SockRef::from(&borrowed).local_addr()?;
        // SAFETY: the caller hands ownership of `fd` to us.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        socket.set_cloexec(true)?;
        Ok(Self {
            key: key.to_string(),
            socket,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Bound address.
    pub fn local_addr(&self) -> io::Result<SockAddr> {
        self.socket.local_addr()
    }

    /// Filesystem path, for Unix listeners.
    pub fn unix_path(&self) -> Option<PathBuf> {
        let addr = self.local_addr().ok()?;
        addr.as_pathname().map(Path::to_path_buf)
    }

    /// Accept one connection.
    pub fn accept(&self) -> io::Result<Socket> {
        self.socket.accept().map(|(conn, _)| conn)
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        self.socket.set_nonblocking(on)
    }

    /// Allow or forbid the descriptor to survive `exec`.
    pub fn set_inheritable(&self, on: bool) -> io::Result<()> {
        self.socket.set_cloexec(!on)
    }
}

/// Log-friendly name of a listener: `host:port` or the socket path.
pub fn sock_name(listener: &Listener) -> String {
    match listener.local_addr() {
        Ok(addr) => match (addr.as_socket(), addr.as_pathname()) {
            (Some(inet), _) => inet.to_string(),
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "unknown".to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

pub(crate) fn remove_stale_socket(path: &Path) -> MasterResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            warn!("unlinking existing socket={}", path.display());
            fs::remove_file(path)?;
            Ok(())
        }
        Ok(_) => Err(MasterError::NotASocket {
            path: path.display().to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn apply_socket_options(socket: &Socket, spec: &ListenerSpec, opts: &SocketSection) -> io::Result<()> {
    if let Some(size) = opts.rcvbuf {
        socket.set_recv_buffer_size(size)?;
    }
    if let Some(size) = opts.sndbuf {
        socket.set_send_buffer_size(size)?;
    }
    if !matches!(spec, ListenerSpec::Tcp(_)) {
        return Ok(());
    }

    if let Some(on) = opts.tcp_nodelay {
        socket.set_nodelay(on)?;
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(on) = opts.tcp_nopush {
            socket.set_cork(on)?;
        }
        set_defer_accept(socket)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_defer_accept(socket: &Socket) -> io::Result<()> {
    let seconds: libc::c_int = 1;
    // SAFETY: TCP_DEFER_ACCEPT takes a c_int; the pointer and length match.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            (&seconds as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// First port of `range` that is neither reserved nor bound by anyone else.
pub fn find_available_port(host: &str, range: (u16, u16), reserved: &BTreeSet<u16>) -> MasterResult<u16> {
    let (start, end) = range;
    (start..end)
        .filter(|port| !reserved.contains(port))
        .find(|port| TcpListener::bind((host, *port)).is_ok())
        .ok_or(MasterError::NoAvailablePort { start, end })
}

// ─── Listener sets ──────────────────────────────────────────────────

/// Every listener owned by the master, keyed by listener key.
#[derive(Debug, Default)]
pub struct Listeners {
    sets: BTreeMap<String, Vec<Listener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every spec of `key`.
    pub fn init(&mut self, key: &str, specs: &[String], opts: &SocketSection) -> MasterResult<()> {
        if self.sets.contains_key(key) {
            return Err(MasterError::ListenerExists { key: key.to_string() });
        }
        let listeners = specs
            .iter()
            .map(|spec| spec.parse::<ListenerSpec>().and_then(|spec| Listener::bind(key, &spec, opts)))
            .collect::<MasterResult<Vec<_>>>()?;
        self.sets.insert(key.to_string(), listeners);
        Ok(())
    }

    /// Rebuild listeners from a `key|fd,key|fd` value.
    ///
    /// An empty value yields an empty set.
    pub fn inherit(encoded: &str) -> MasterResult<Self> {
        let mut listeners = Self::new();
        let mut seen = BTreeSet::new();
        for entry in encoded.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let bad = || MasterError::InheritedFd {
                entry: entry.to_string(),
            };
            let (key, fd) = entry.rsplit_once('|').ok_or_else(bad)?;
            let fd: RawFd = fd.parse().map_err(|_| bad())?;
            if fd < 0 || !seen.insert(fd) {
                return Err(bad());
            }
            let key = if key.is_empty() { DEFAULT_LISTENER_KEY } else { key };

            // SAFETY: the predecessor handed this descriptor to us through exec
            // and nothing else in this process has claimed it.
            let listener = unsafe { Listener::from_inherited(key, fd) }.map_err(|_| bad())?;
            info!("inherited addr={} fd={fd} key={key}", sock_name(&listener));
            listeners.sets.entry(key.to_string()).or_default().push(listener);
        }
        Ok(listeners)
    }

    /// Encode every listener as `key|fd` pairs joined by commas.
    pub fn encode(&self) -> String {
        self.iter()
            .map(|l| format!("{}|{}", l.key(), l.fd()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Listeners of `key`; empty when unknown.
    pub fn get(&self, key: &str) -> &[Listener] {
        self.sets.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Move the listeners of `key` out.
    pub fn take(&mut self, key: &str) -> Vec<Listener> {
        self.sets.remove(key).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sets.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.sets.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(Vec::is_empty)
    }

    /// Toggle close-on-exec on every listener.
    pub fn set_inheritable(&self, on: bool) -> io::Result<()> {
        self.iter().try_for_each(|l| l.set_inheritable(on))
    }

    /// Give up ownership of every descriptor without closing it.
    pub fn into_raw_fds(self) -> Vec<RawFd> {
        self.sets
            .into_values()
            .flatten()
            .map(|l| l.socket.into_raw_fd())
            .collect()
    }

    /// Close every listener. Unix socket paths are removed when `unlink` is set.
    pub fn close_all(&mut self, unlink: bool) {
        for listener in std::mem::take(&mut self.sets).into_values().flatten() {
            let path = listener.unix_path();
            debug!("closing listener addr={}", sock_name(&listener));
            drop(listener);
            if let Some(path) = path.filter(|_| unlink)
                && let Err(e) = fs::remove_file(&path)
            {
                warn!("failed to unlink {}: {e}", path.display());
            }
        }
    }
}
