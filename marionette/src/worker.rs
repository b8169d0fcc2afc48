//! Per-process supervision handle.
//!
//! A [`Worker`] is created by its puppet in the master, travels through
//! `fork`, and lives on in the child as the payload's view of its own
//! health: the heartbeat it toggles, the parent it must not outlive and the
//! stop flag set by QUIT/INT.

use crate::error::MasterResult;
use crate::master::Master;
use crate::process_utils::{set_cloexec, tmpio};
use crate::puppet::Puppet;
use nix::unistd::{Pid, getppid};
use std::cell::Cell;
use std::fs::{File, Permissions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

// ─── Heartbeat ──────────────────────────────────────────────────────

/// Anonymous file whose ctime advances every time the owner toggles its mode.
///
/// Written only by the worker, stat'd only by the master.
#[derive(Debug)]
pub struct Heartbeat {
    file: File,
    mode: Cell<bool>,
    created: SystemTime,
}

impl Heartbeat {
    pub fn new() -> io::Result<Self> {
        let file = tmpio()?;
        file.set_permissions(Permissions::from_mode(0o000))?;
        let created = ctime_of(&file)?;
        Ok(Self {
            file,
            mode: Cell::new(false),
            created,
        })
    }

    /// Flip the mode bit; advances ctime.
    pub fn toggle(&self) -> io::Result<()> {
        let next = !self.mode.get();
        self.file
            .set_permissions(Permissions::from_mode(if next { 0o100 } else { 0o000 }))?;
        self.mode.set(next);
        Ok(())
    }

    /// Time of the last toggle, or creation time before the first one.
    pub fn last_change(&self) -> io::Result<SystemTime> {
        ctime_of(&self.file)
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Whether the heartbeat advanced since creation.
    pub fn checked_in(&self) -> bool {
        self.last_change().is_ok_and(|t| t > self.created)
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn ctime_of(file: &File) -> io::Result<SystemTime> {
    let meta = file.metadata()?;
    let secs = u64::try_from(meta.ctime()).unwrap_or(0);
    let nanos = u32::try_from(meta.ctime_nsec()).unwrap_or(0);
    Ok(UNIX_EPOCH + Duration::new(secs, nanos))
}

// ─── Worker ─────────────────────────────────────────────────────────

/// One supervised child of a puppet.
#[derive(Debug)]
pub struct Worker {
    nr: usize,
    pool: Option<String>,
    proc_tag: String,
    heartbeat: Heartbeat,
    master_pid: Pid,
    stop: Arc<AtomicBool>,
    spawned_at: SystemTime,
}

impl Worker {
    /// New worker `nr` of `pool`, owned by the master `master_pid`.
    pub fn new(pool: Option<&str>, tag_prefix: Option<&str>, nr: usize, master_pid: Pid) -> io::Result<Self> {
        let proc_tag = match tag_prefix {
            Some(prefix) => format!("{prefix}.{nr}"),
            None => nr.to_string(),
        };
        Ok(Self {
            nr,
            pool: pool.map(str::to_string),
            proc_tag,
            heartbeat: Heartbeat::new()?,
            master_pid,
            stop: Arc::new(AtomicBool::new(false)),
            spawned_at: SystemTime::now(),
        })
    }

    /// Ordinal within the pool.
    pub fn nr(&self) -> usize {
        self.nr
    }

    /// Pool key; `None` for the main puppet.
    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    /// `<prefix>.<nr>`, or just `<nr>` without a prefix.
    pub fn proc_tag(&self) -> &str {
        &self.proc_tag
    }

    pub fn master_pid(&self) -> Pid {
        self.master_pid
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn spawned_at(&self) -> SystemTime {
        self.spawned_at
    }

    /// Keep working: the master that forked us is still our parent and
    /// nobody asked us to stop.
    pub fn ok(&self) -> bool {
        self.is_master_ok() && !self.stopped()
    }

    pub fn is_master_ok(&self) -> bool {
        getppid() == self.master_pid
    }

    /// Toggle the heartbeat.
    pub fn alive(&self) {
        if let Err(e) = self.heartbeat.toggle() {
            warn!("worker {} heartbeat error: {e}", self.proc_tag);
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Heartbeat advanced since the worker was created.
    pub fn checked_in(&self) -> bool {
        self.heartbeat.checked_in()
    }

    /// Trap QUIT/INT into the stop flag and make TERM exit at once.
    ///
    /// Called in the child while the fork-time signal mask is still in
    /// place, so a signal sent right after fork lands here.
    pub fn trap_signals(&self) -> io::Result<()> {
        for signum in [libc::SIGQUIT, libc::SIGINT] {
            signal_hook::flag::register(signum, Arc::clone(&self.stop))?;
        }
        // SAFETY: `exit` is `_exit(2)`, which is async-signal-safe.
        unsafe {
            signal_hook::low_level::register(libc::SIGTERM, || signal_hook::low_level::exit(0))?;
        }
        Ok(())
    }

    /// Post-fork initialization, run once in the child before the work loop.
    ///
    /// Order matters: the log sink is reopened first so that everything
    /// after it logs into a descriptor owned by this process.
    pub fn init(&self, master: &mut Master, puppet: &mut Puppet) -> MasterResult<()> {
        master.reopen_logger();
        master.detach_listeners_from_master()?;
        master.reset_services();
        master.resign(&format!("worker[{}]", self.proc_tag));
        puppet.resign();
        master.reset_application(self);
        set_cloexec(self.heartbeat.fd(), true)?;
        puppet.after_fork(self);
        Ok(())
    }
}
