//! Low-level process helpers.
//!
//! Anonymous heartbeat files, liveness checks, signal delivery that treats a
//! vanished process as success, pid files and the process title.

use crate::error::MasterResult;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgrp, getpid, getppid};
use std::fs::{self, File};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Poll interval while waiting for a pid file process to exit.
const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// Create an anonymous, already-unlinked scratch file.
///
/// The file lives only as long as open descriptors reference it, so a
/// crashed master leaves nothing behind in the temp directory.
pub fn tmpio() -> io::Result<File> {
    tempfile::tempfile()
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // Process exists but no permission to signal
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid`, if it is our child, has exited. Reaps it when it has.
///
/// Returns `None` when `pid` is not our child.
pub fn reap_if_exited(pid: Pid) -> Option<bool> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Some(false),
        Ok(_) => Some(true),
        Err(_) => None,
    }
}

/// Send `signal` to `pid`.
///
/// Returns `Ok(false)` when the process no longer exists; callers treat that
/// as an already-completed termination.
pub fn send_signal(pid: Pid, signal: Signal) -> MasterResult<bool> {
    match kill(pid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether this master runs detached from a controlling terminal session:
/// re-parented to init, or not the leader of its process group.
pub fn is_daemonized() -> bool {
    getppid() == Pid::from_raw(1) || getpgrp() != getpid()
}

/// Set or clear `FD_CLOEXEC` on a raw descriptor.
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch the descriptor flags of `fd`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: see above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read `FD_CLOEXEC` of a raw descriptor.
pub fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    // SAFETY: F_GETFD only reads the descriptor flags of `fd`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// Rename the current process.
///
/// On Linux this sets the kernel task name (`/proc/<pid>/comm`, 15 bytes),
/// which is what `ps -o comm` and `top` show.
pub fn set_proc_name(name: &str) {
    #[cfg(target_os = "linux")]
    {
        let mut buf = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(15);
        buf[..len].copy_from_slice(&bytes[..len]);
        // SAFETY: PR_SET_NAME reads at most 16 bytes from a NUL-terminated buffer.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = name;
    }
}

// ─── Pid files ──────────────────────────────────────────────────────

/// A pid file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Wrap `path`. Nothing is read or written yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path used by a re-exec'd master: `x.pid` becomes `x.reexec.pid`.
    pub fn reexec_path(&self) -> PathBuf {
        let suffix = marionette_common::consts::REEXEC_PID_SUFFIX;
        let s = self.path.to_string_lossy();
        match s.strip_suffix(".pid") {
            Some(stem) => PathBuf::from(format!("{stem}{suffix}.pid")),
            None => PathBuf::from(format!("{s}{suffix}")),
        }
    }

    /// Configured path of a re-exec'd master's pid file: inverse of [`Self::reexec_path`].
    pub fn configured_path(&self) -> PathBuf {
        let suffix = marionette_common::consts::REEXEC_PID_SUFFIX;
        let s = self.path.to_string_lossy();
        if let Some(stem) = s.strip_suffix(&format!("{suffix}.pid")) {
            PathBuf::from(format!("{stem}.pid"))
        } else if let Some(stem) = s.strip_suffix(suffix) {
            PathBuf::from(stem)
        } else {
            self.path.clone()
        }
    }

    /// Pid recorded in the file, if the file exists and parses.
    pub fn read(&self) -> Option<Pid> {
        if !self.path.is_file() {
            return None;
        }
        fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
    }

    /// Recorded pid, if that process is alive.
    pub fn running(&self) -> Option<Pid> {
        self.read().filter(|pid| is_process_alive(*pid))
    }

    /// Write our pid, replacing a stale file left by a dead process.
    pub fn write(&self) -> MasterResult<()> {
        if self.path.exists() && self.running().is_none() {
            warn!("Deleting stale pid file: {}", self.path.display());
            fs::remove_file(&self.path)?;
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        info!("Writing pid to {}", self.path.display());
        fs::write(&self.path, getpid().as_raw().to_string())?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    /// Remove the file if it still records our own pid.
    pub fn cleanup(&self) -> MasterResult<()> {
        if self.read() == Some(getpid()) {
            info!("Removing pid file: {}", self.path.display());
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Move the file to `dest` and track it there.
    pub fn rename(&mut self, dest: impl Into<PathBuf>) -> MasterResult<()> {
        let dest = dest.into();
        fs::rename(&self.path, &dest)?;
        self.path = dest;
        Ok(())
    }

    /// Signal the recorded process. Returns the pid if one was recorded.
    pub fn send_signal(&self, signal: Signal) -> MasterResult<Option<Pid>> {
        match self.read() {
            Some(pid) => {
                send_signal(pid, signal)?;
                Ok(Some(pid))
            }
            None => Ok(None),
        }
    }

    /// KILL the recorded process and delete the file.
    pub fn force_kill(&self) -> MasterResult<Option<Pid>> {
        let pid = self.send_signal(Signal::SIGKILL)?;
        if pid.is_some() && self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(pid)
    }

    /// Stop the recorded process: QUIT (INT when `timeout` is zero), then
    /// KILL once `timeout` has elapsed.
    pub fn terminate(&self, timeout: Duration) -> MasterResult<Option<Pid>> {
        let signal = if timeout.is_zero() {
            Signal::SIGINT
        } else {
            Signal::SIGQUIT
        };
        let Some(pid) = self.send_signal(signal)? else {
            return Ok(None);
        };

        // An unrepresentable deadline waits for good.
        let deadline = Instant::now().checked_add(timeout);
        while !has_exited(pid) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Timeout reached. Sending KILL to {pid}.");
                self.force_kill()?;
                break;
            }
            thread::sleep(TERMINATE_POLL);
        }
        Ok(Some(pid))
    }
}

/// Whether `pid` is gone. Reaps it first if it is our child.
pub fn has_exited(pid: Pid) -> bool {
    reap_if_exited(pid).unwrap_or_else(|| !is_process_alive(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    #[test]
    fn test_tmpio_is_unlinked() {
        let file = tmpio().unwrap();
        let meta = file.metadata().unwrap();
        assert!(meta.is_file());
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.nlink(), 0, "heartbeat file must not have a name");
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(getpid()));
    }

    #[test]
    fn test_cloexec_toggle() {
        let file = tmpio().unwrap();
        let fd = file.as_raw_fd();
        set_cloexec(fd, false).unwrap();
        assert!(!is_cloexec(fd).unwrap());
        set_cloexec(fd, true).unwrap();
        assert!(is_cloexec(fd).unwrap());
    }

    #[test]
    fn test_pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("pids/m.pid"));
        assert_eq!(pid_file.read(), None);

        pid_file.write().unwrap();
        assert_eq!(pid_file.read(), Some(getpid()));
        assert_eq!(pid_file.running(), Some(getpid()));

        pid_file.cleanup().unwrap();
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn test_pid_file_garbage_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.pid");
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(PidFile::new(&path).read(), None);
        fs::write(&path, "-5").unwrap();
        assert_eq!(PidFile::new(&path).read(), None);
    }

    #[test]
    fn test_reexec_path_mapping() {
        let pid_file = PidFile::new("/run/m.pid");
        assert_eq!(pid_file.reexec_path(), PathBuf::from("/run/m.reexec.pid"));

        let successor = PidFile::new(pid_file.reexec_path());
        assert_eq!(successor.configured_path(), PathBuf::from("/run/m.pid"));

        let odd = PidFile::new("/run/m.lock");
        assert_eq!(odd.reexec_path(), PathBuf::from("/run/m.lock.reexec"));
        assert_eq!(PidFile::new(odd.reexec_path()).configured_path(), PathBuf::from("/run/m.lock"));
    }

    #[test]
    fn test_rename_moves_file() {
        let dir = TempDir::new().unwrap();
        let mut pid_file = PidFile::new(dir.path().join("m.reexec.pid"));
        pid_file.write().unwrap();

        let dest = pid_file.configured_path();
        pid_file.rename(&dest).unwrap();
        assert_eq!(pid_file.path(), dest.as_path());
        assert_eq!(pid_file.read(), Some(getpid()));
    }

    #[test]
    fn test_missing_pid_file_signals_nobody() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("absent.pid"));
        assert_eq!(pid_file.send_signal(Signal::SIGQUIT).unwrap(), None);
        assert_eq!(pid_file.terminate(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_terminate_with_unbounded_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sleeper.pid");
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        fs::write(&path, pid.as_raw().to_string()).unwrap();

        let started = Instant::now();
        assert_eq!(PidFile::new(&path).terminate(Duration::MAX).unwrap(), Some(pid));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(has_exited(pid));
    }
}
