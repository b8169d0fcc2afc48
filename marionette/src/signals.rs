//! Deferred signal handling for the master.
//!
//! Handlers installed here never run supervisor logic. Each one writes the
//! signal number into a non-blocking self-pipe and returns; the master loop
//! drains the pipe into a bounded FIFO [`SignalQueue`] and dispatches one
//! signal per iteration.

use marionette_common::consts::SIGNAL_QUEUE_CAPACITY;
use heapless::Deque;
use nix::fcntl::OFlag;
use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, signal};
use nix::unistd::pipe2;
use signal_hook::SigId;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use tracing::error;

/// Signals the master traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MasterSignal {
    /// Graceful stop.
    Quit,
    /// Graceful stop.
    Int,
    /// Immediate stop.
    Term,
    /// Soft re-exec.
    Usr1,
    /// Re-exec, then kill the predecessor once the successor is up.
    Usr2,
    /// Stop respawning, gracefully kill every child (daemon mode only).
    Winch,
    /// Re-enable respawning.
    Hup,
    /// One more main worker.
    Ttin,
    /// One fewer main worker.
    Ttou,
}

impl MasterSignal {
    /// Every queued signal, in handler installation order.
    pub const TRAPPED: [MasterSignal; 9] = [
        MasterSignal::Quit,
        MasterSignal::Int,
        MasterSignal::Term,
        MasterSignal::Usr1,
        MasterSignal::Usr2,
        MasterSignal::Winch,
        MasterSignal::Hup,
        MasterSignal::Ttin,
        MasterSignal::Ttou,
    ];

    /// OS signal.
    pub fn as_signal(self) -> Signal {
        match self {
            MasterSignal::Quit => Signal::SIGQUIT,
            MasterSignal::Int => Signal::SIGINT,
            MasterSignal::Term => Signal::SIGTERM,
            MasterSignal::Usr1 => Signal::SIGUSR1,
            MasterSignal::Usr2 => Signal::SIGUSR2,
            MasterSignal::Winch => Signal::SIGWINCH,
            MasterSignal::Hup => Signal::SIGHUP,
            MasterSignal::Ttin => Signal::SIGTTIN,
            MasterSignal::Ttou => Signal::SIGTTOU,
        }
    }

    /// Map a raw signal number back, if trapped.
    pub fn from_raw(signum: i32) -> Option<Self> {
        Self::TRAPPED
            .into_iter()
            .find(|s| s.as_signal() as i32 == signum)
    }

    /// Short upper-case name, as operators type it.
    pub fn name(self) -> &'static str {
        match self {
            MasterSignal::Quit => "QUIT",
            MasterSignal::Int => "INT",
            MasterSignal::Term => "TERM",
            MasterSignal::Usr1 => "USR1",
            MasterSignal::Usr2 => "USR2",
            MasterSignal::Winch => "WINCH",
            MasterSignal::Hup => "HUP",
            MasterSignal::Ttin => "TTIN",
            MasterSignal::Ttou => "TTOU",
        }
    }
}

/// Parse `TERM`, `SIGTERM`, `term` or `15` into a signal.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let trimmed = name.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        return Signal::try_from(n).ok();
    }
    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse::<Signal>().ok()
}

// ─── Queue ──────────────────────────────────────────────────────────

/// Bounded FIFO of pending master signals.
///
/// A full queue drops the newest signal and logs it; queued signals keep
/// their order.
#[derive(Debug, Default)]
pub struct SignalQueue {
    queue: Deque<MasterSignal, SIGNAL_QUEUE_CAPACITY>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self { queue: Deque::new() }
    }

    /// Queue `signal`. Returns `false` if it was dropped.
    pub fn push(&mut self, signal: MasterSignal) -> bool {
        match self.queue.push_back(signal) {
            Ok(()) => true,
            Err(dropped) => {
                error!(
                    "Signal queue full ({} pending), dropping {}",
                    SIGNAL_QUEUE_CAPACITY,
                    dropped.name()
                );
                false
            }
        }
    }

    /// Oldest pending signal.
    pub fn pop(&mut self) -> Option<MasterSignal> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ─── Self-pipe ──────────────────────────────────────────────────────

/// Non-blocking pipe the signal handlers write into.
#[derive(Debug)]
pub struct SelfPipe {
    reader: File,
    writer: OwnedFd,
}

impl SelfPipe {
    /// Open a close-on-exec, non-blocking pipe.
    pub fn new() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(Self {
            reader: File::from(read),
            writer: write,
        })
    }

    /// Raw write end, for handlers.
    pub fn write_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }

    /// Read end, for polling.
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Wake the loop from ordinary code.
    pub fn wake(&self) {
        write_byte(self.write_fd(), 0);
    }

    /// Drain every pending byte. Non-zero bytes are signal numbers.
    pub fn drain(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend(buf[..n].iter().filter(|b| **b != 0).map(|b| *b as i32)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        out
    }
}

fn write_byte(fd: RawFd, byte: u8) {
    let buf = [byte];
    // SAFETY: write(2) is async-signal-safe; a full pipe just drops the byte.
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), 1);
    }
}

// ─── Installation ───────────────────────────────────────────────────

/// Handlers installed by the master, removable after fork.
#[derive(Debug, Default)]
pub struct SignalHandlers {
    ids: Vec<SigId>,
}

impl SignalHandlers {
    /// Trap every [`MasterSignal`] plus `SIGCHLD` into `pipe`.
    ///
    /// `SIGCHLD` writes a zero byte: a wake with nothing to queue.
    pub fn install(pipe: &SelfPipe) -> io::Result<Self> {
        let fd = pipe.write_fd();
        let mut ids = Vec::with_capacity(MasterSignal::TRAPPED.len() + 1);

        for signal in MasterSignal::TRAPPED {
            let signum = signal.as_signal() as i32;
            // SAFETY: the action only calls write(2).
            let id = unsafe {
                signal_hook::low_level::register(signum, move || write_byte(fd, signum as u8))
            }?;
            ids.push(id);
        }
        // SAFETY: as above.
        let id = unsafe {
            signal_hook::low_level::register(libc::SIGCHLD, move || write_byte(fd, 0))
        }?;
        ids.push(id);

        Ok(Self { ids })
    }

    /// Remove every action installed by [`Self::install`].
    pub fn uninstall(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

impl Drop for SignalHandlers {
    fn drop(&mut self) {
        self.uninstall();
    }
}

// ─── Fork window ────────────────────────────────────────────────────

/// Every signal the master traps, `SIGCHLD` included.
pub fn trapped_set() -> SigSet {
    let mut set = SigSet::empty();
    for trapped in MasterSignal::TRAPPED {
        set.add(trapped.as_signal());
    }
    set.add(Signal::SIGCHLD);
    set
}

/// Block the trapped signals on this thread. Returns the previous mask.
///
/// Held across `fork()` so that nothing reaches the master's actions in the
/// child before the child has replaced them.
pub fn block_trapped() -> nix::Result<SigSet> {
    trapped_set().thread_swap_mask(SigmaskHow::SIG_BLOCK)
}

/// Put back a mask returned by [`block_trapped`].
pub fn restore_mask(mask: &SigSet) -> nix::Result<()> {
    mask.thread_set_mask()
}

/// Default disposition for every trapped signal.
///
/// Only for a child that is about to exec: signal-hook does not reinstall
/// its handler for a signal whose disposition was replaced behind its back.
pub fn reset_to_default() -> nix::Result<()> {
    for sig in trapped_set().iter() {
        // SAFETY: SIG_DFL installs no Rust code as a handler.
        unsafe { signal(sig, SigHandler::SigDfl) }?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keeps_order_and_drops_overflow() {
        let mut queue = SignalQueue::new();
        let pushed = [
            MasterSignal::Hup,
            MasterSignal::Ttin,
            MasterSignal::Ttou,
            MasterSignal::Usr1,
            MasterSignal::Winch,
            MasterSignal::Quit,
            MasterSignal::Term,
        ];
        let accepted: Vec<bool> = pushed.iter().map(|s| queue.push(*s)).collect();
        assert_eq!(accepted, [true, true, true, true, true, false, false]);
        assert_eq!(queue.len(), SIGNAL_QUEUE_CAPACITY);

        let drained: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(drained, &pushed[..5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_from_raw_round_trip() {
        for signal in MasterSignal::TRAPPED {
            assert_eq!(MasterSignal::from_raw(signal.as_signal() as i32), Some(signal));
        }
        assert_eq!(MasterSignal::from_raw(libc::SIGCHLD), None);
        assert_eq!(MasterSignal::from_raw(0), None);
    }

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("sigquit"), Some(Signal::SIGQUIT));
        assert_eq!(parse_signal("9"), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("NOPE"), None);
    }

    #[test]
    fn test_block_trapped_masks_and_restores() {
        let before = SigSet::thread_get_mask().unwrap();
        let previous = block_trapped().unwrap();
        assert_eq!(previous, before);

        let blocked = SigSet::thread_get_mask().unwrap();
        assert!(blocked.contains(Signal::SIGQUIT));
        assert!(blocked.contains(Signal::SIGCHLD));
        assert!(blocked.contains(Signal::SIGTTOU));

        restore_mask(&previous).unwrap();
        assert_eq!(SigSet::thread_get_mask().unwrap(), before);
    }

    #[test]
    fn test_self_pipe_drain() {
        let pipe = SelfPipe::new().unwrap();
        assert!(pipe.drain().is_empty());

        pipe.wake();
        write_byte(pipe.write_fd(), libc::SIGHUP as u8);
        write_byte(pipe.write_fd(), libc::SIGTTIN as u8);

        assert_eq!(pipe.drain(), vec![libc::SIGHUP, libc::SIGTTIN]);
        assert!(pipe.drain().is_empty());
    }
}
