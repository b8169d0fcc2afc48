//! End-to-end tests against the `marionette` binary.
//!
//! Processes are found through `/proc/<pid>/stat`; zombies count as dead.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

struct ProcStat {
    pid: Pid,
    comm: String,
    state: char,
    ppid: Pid,
}

fn proc_stat(pid: i32) -> Option<ProcStat> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let comm = raw[open + 1..close].to_string();
    let mut rest = raw[close + 1..].split_whitespace();
    let state = rest.next()?.chars().next()?;
    let ppid = rest.next()?.parse().ok()?;
    Some(ProcStat {
        pid: Pid::from_raw(pid),
        comm,
        state,
        ppid: Pid::from_raw(ppid),
    })
}

fn is_running(pid: Pid) -> bool {
    proc_stat(pid.as_raw()).is_some_and(|s| s.state != 'Z')
}

fn workers_of(master: Pid) -> Vec<Pid> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(proc_stat)
        .filter(|s| s.ppid == master && s.state != 'Z' && s.comm.starts_with("worker"))
        .map(|s| s.pid)
        .collect()
}

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    done()
}

fn command(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_marionette"));
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn marionette(args: &[&str]) -> Child {
    command(args).spawn().unwrap()
}

fn read_pid(path: &Path) -> Option<Pid> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Pid::from_raw)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[test]
fn test_workers_die_after_master_is_killed() {
    let mut child = marionette(&["run", "--workers", "3", "--tag", "e2e", "--timeout", "5"]);
    let master = Pid::from_raw(child.id() as i32);

    assert!(
        wait_until(Duration::from_secs(30), || workers_of(master).len() == 3),
        "expected 3 workers, saw {:?}",
        workers_of(master)
    );
    let workers = workers_of(master);
    assert!(proc_stat(master.as_raw()).unwrap().comm.starts_with("master[e2e]"));

    kill(master, Signal::SIGKILL).unwrap();
    child.wait().unwrap();

    assert!(
        wait_until(Duration::from_secs(60), || !workers.iter().any(|w| is_running(*w))),
        "orphaned workers still running: {workers:?}"
    );
}

#[test]
fn test_quit_stops_master_and_workers() {
    let mut child = marionette(&["run", "--workers", "2", "--timeout", "5"]);
    let master = Pid::from_raw(child.id() as i32);

    assert!(wait_until(Duration::from_secs(30), || workers_of(master).len() == 2));
    let workers = workers_of(master);

    kill(master, Signal::SIGQUIT).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success(), "master exited with {status}");
    assert!(!workers.iter().any(|w| is_running(*w)));
}

#[test]
fn test_ttin_grows_the_pool() {
    let mut child = marionette(&["run", "--workers", "1", "--timeout", "5"]);
    let master = Pid::from_raw(child.id() as i32);
    assert!(wait_until(Duration::from_secs(30), || workers_of(master).len() == 1));

    kill(master, Signal::SIGTTIN).unwrap();
    kill(master, Signal::SIGTTIN).unwrap();
    assert!(wait_until(Duration::from_secs(30), || workers_of(master).len() == 3));

    kill(master, Signal::SIGTTOU).unwrap();
    assert!(wait_until(Duration::from_secs(30), || workers_of(master).len() == 2));

    kill(master, Signal::SIGTERM).unwrap();
    child.wait().unwrap();
}

#[test]
fn test_pid_file_written_and_removed() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("m.pid");
    let pid_arg = pid_path.display().to_string();

    let mut child = marionette(&["run", "--workers", "1", "--pid-file", &pid_arg]);
    let master = Pid::from_raw(child.id() as i32);
    assert!(wait_until(Duration::from_secs(30), || read_pid(&pid_path) == Some(master)));

    let status = Command::new(env!("CARGO_BIN_EXE_marionette"))
        .args(["status", "--pid-file", &pid_arg])
        .output()
        .unwrap();
    assert!(status.status.success());
    assert!(String::from_utf8_lossy(&status.stdout).contains(&master.to_string()));

    kill(master, Signal::SIGQUIT).unwrap();
    child.wait().unwrap();
    assert!(!pid_path.exists());

    let status = Command::new(env!("CARGO_BIN_EXE_marionette"))
        .args(["status", "--pid-file", &pid_arg])
        .output()
        .unwrap();
    assert_eq!(status.status.code(), Some(3));
}

#[test]
fn test_usr2_hands_over_to_successor() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("m.pid");
    let pid_arg = pid_path.display().to_string();

    let mut child = marionette(&[
        "run",
        "--workers",
        "2",
        "--timeout",
        "5",
        "--pid-file",
        &pid_arg,
        "--listen",
        "127.0.0.1:0",
    ]);
    let old = Pid::from_raw(child.id() as i32);
    assert!(wait_until(Duration::from_secs(30), || {
        read_pid(&pid_path) == Some(old) && workers_of(old).len() == 2
    }));

    kill(old, Signal::SIGUSR2).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success(), "old master exited with {status}");

    assert!(
        wait_until(Duration::from_secs(30), || read_pid(&pid_path).is_some_and(|p| p != old)),
        "successor never took over the pid file"
    );
    let new = read_pid(&pid_path).unwrap();
    assert!(is_running(new));
    assert!(wait_until(Duration::from_secs(30), || workers_of(new).len() == 2));

    let workers = workers_of(new);
    kill(new, Signal::SIGQUIT).unwrap();
    assert!(wait_until(Duration::from_secs(30), || !is_running(new)));
    assert!(!workers.iter().any(|w| is_running(*w)));
}

#[test]
fn test_winch_ignored_by_foreground_master() {
    // Own process group, parented by this test: not daemonized.
    let mut child = command(&["run", "--workers", "2", "--timeout", "5"])
        .process_group(0)
        .spawn()
        .unwrap();
    let master = Pid::from_raw(child.id() as i32);
    assert!(wait_until(Duration::from_secs(30), || workers_of(master).len() == 2));
    let mut workers = workers_of(master);
    workers.sort();

    kill(master, Signal::SIGWINCH).unwrap();
    thread::sleep(Duration::from_secs(2));

    let mut after = workers_of(master);
    after.sort();
    assert_eq!(after, workers, "WINCH must not touch a foreground master's workers");

    kill(master, Signal::SIGQUIT).unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn test_usr1_starts_successor_and_keeps_predecessor() {
    let dir = TempDir::new().unwrap();
    let pid_path = dir.path().join("m.pid");
    let successor_path = dir.path().join("m.reexec.pid");
    let pid_arg = pid_path.display().to_string();

    let mut child = marionette(&[
        "run",
        "--workers",
        "1",
        "--timeout",
        "5",
        "--pid-file",
        &pid_arg,
        "--listen",
        "127.0.0.1:0",
    ]);
    let old = Pid::from_raw(child.id() as i32);
    assert!(wait_until(Duration::from_secs(30), || {
        read_pid(&pid_path) == Some(old) && workers_of(old).len() == 1
    }));

    kill(old, Signal::SIGUSR1).unwrap();
    assert!(
        wait_until(Duration::from_secs(30), || read_pid(&successor_path).is_some_and(is_running)),
        "successor never wrote {}",
        successor_path.display()
    );
    let new = read_pid(&successor_path).unwrap();
    assert!(wait_until(Duration::from_secs(30), || workers_of(new).len() == 1));

    // No matricide: both masters keep running side by side.
    thread::sleep(Duration::from_secs(2));
    assert!(is_running(old));
    assert_eq!(read_pid(&pid_path), Some(old));
    assert_eq!(read_pid(&successor_path), Some(new));

    kill(new, Signal::SIGQUIT).unwrap();
    assert!(wait_until(Duration::from_secs(30), || !is_running(new)));
    assert!(!successor_path.exists());

    kill(old, Signal::SIGQUIT).unwrap();
    assert!(child.wait().unwrap().success());
    assert!(!pid_path.exists());
}
