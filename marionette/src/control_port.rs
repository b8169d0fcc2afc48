//! Operator command channel on a Unix socket.
//!
//! Line protocol: `!stats` answers with master and worker uptimes, `!quit`
//! closes the connection, anything else gets `Unknown command` and the
//! connection stays open. The socket is non-blocking and serviced from the
//! master loop, so no thread is involved.

use crate::error::MasterResult;
use crate::socket::remove_stale_socket;
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest line a client may send before it is disconnected.
const MAX_LINE: usize = 4096;

/// Parsed client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stats,
    Quit,
}

impl Command {
    /// Parse one line. Commands start with `!`.
    pub fn parse(line: &str) -> Result<Self, &'static str> {
        match line.trim().strip_prefix('!') {
            Some("stats") => Ok(Command::Stats),
            Some("quit") => Ok(Command::Quit),
            _ => Err("Unknown command"),
        }
    }
}

/// One worker line of `!stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStat {
    pub pid: Pid,
    pub uptime: Duration,
    pub last_ping: Duration,
}

/// `N day(s), HH:MM:SS`, with the day part omitted when zero.
pub fn seconds_in_words(duration: Duration) -> String {
    let total = duration.as_secs();
    let (mm, ss) = (total / 60, total % 60);
    let (hh, mm) = (mm / 60, mm % 60);
    let (dd, hh) = (hh / 24, hh % 24);

    let mut words = String::new();
    if dd > 0 {
        words.push_str(&format!("{dd} day{}, ", if dd > 1 { "s" } else { "" }));
    }
    words.push_str(&format!("{hh:02}:{mm:02}:{ss:02}"));
    words
}

/// Full `!stats` reply.
pub fn format_stats(master_pid: Pid, master_uptime: Duration, workers: &[WorkerStat]) -> String {
    let pids = workers
        .iter()
        .map(|w| w.pid.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = format!(
        "master {master_pid} up {}\nworkers {pids}\n",
        seconds_in_words(master_uptime)
    );
    for w in workers {
        out.push_str(&format!(
            "worker {} up {} pi {}\n",
            w.pid,
            seconds_in_words(w.uptime),
            seconds_in_words(w.last_ping)
        ));
    }
    out
}

struct Client {
    stream: UnixStream,
    buf: Vec<u8>,
    closed: bool,
}

pub struct ControlPort {
    listener: UnixListener,
    path: PathBuf,
    clients: Vec<Client>,
}

impl std::fmt::Debug for ControlPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPort")
            .field("path", &self.path)
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl ControlPort {
    /// Bind the control socket, replacing a stale one.
    pub fn open(path: &Path) -> MasterResult<Self> {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("control port started: {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            clients: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptors the master loop should poll.
    pub fn fds(&self) -> Vec<BorrowedFd<'_>> {
        std::iter::once(self.listener.as_fd())
            .chain(self.clients.iter().map(|c| c.stream.as_fd()))
            .collect()
    }

    /// Accept pending clients and answer every complete line.
    pub fn process(&mut self, stats: impl Fn() -> String) {
        self.accept_pending();
        for client in &mut self.clients {
            if let Err(e) = serve(client, &stats) {
                debug!("control client error: {e}");
                client.closed = true;
            }
        }
        self.clients.retain(|c| !c.closed);
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("control port client setup failed: {e}");
                        continue;
                    }
                    self.clients.push(Client {
                        stream,
                        buf: Vec::new(),
                        closed: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("control port accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Stop serving. The socket path is removed when `unlink` is set.
    pub fn close(self, unlink: bool) {
        info!("control port stopped");
        let path = self.path.clone();
        drop(self);
        if unlink && path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn serve(client: &mut Client, stats: &impl Fn() -> String) -> io::Result<()> {
    let mut chunk = [0u8; 512];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                client.closed = true;
                break;
            }
            Ok(n) => client.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    while let Some(end) = client.buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = client.buf.drain(..=end).collect();
        let line = String::from_utf8_lossy(&line);
        match Command::parse(&line) {
            Ok(Command::Stats) => reply(&client.stream, &stats())?,
            Ok(Command::Quit) => {
                client.closed = true;
                return Ok(());
            }
            Err(msg) => reply(&client.stream, &format!("{msg}\n"))?,
        }
    }
    if client.buf.len() > MAX_LINE {
        client.closed = true;
    }
    Ok(())
}

fn reply(stream: &UnixStream, text: &str) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let result = (&*stream).write_all(text.as_bytes());
    stream.set_nonblocking(true)?;
    result
}
