//! Worker payloads.
//!
//! The engine does not know what a worker does. It hands each worker to a
//! [`Payload`], which performs one unit of work per call and reports errors
//! as values. Two payloads ship with the binary: `idle` (heartbeat only) and
//! `echo` (line echo on the pool's listener).

use crate::error::{MasterError, MasterResult};
use crate::puppet::PuppetSpec;
use crate::socket::Listener;
use crate::worker::Worker;
use std::io::{self, BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::debug;

/// Error type returned by payloads.
pub type PayloadError = Box<dyn std::error::Error>;

/// What a worker runs.
///
/// Loop puppets call [`Payload::work`] between heartbeats. Event puppets
/// watch [`Payload::watched_fds`] and call [`Payload::readable`] on
/// readiness, with an idle timer keeping the heartbeat going.
pub trait Payload {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Called once in the worker, after init and before the first unit of work.
    fn setup(&mut self, _pool: &PuppetSpec, _listeners: Vec<Listener>) -> Result<(), PayloadError> {
        Ok(())
    }

    /// One unit of work. Must return within roughly one nap interval.
    fn work(&mut self, pool: &PuppetSpec, worker: &Worker) -> Result<(), PayloadError>;

    /// Descriptors an event puppet should watch.
    fn watched_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    /// `fd` became readable.
    fn readable(&mut self, _fd: RawFd, _pool: &PuppetSpec, _worker: &Worker) -> Result<(), PayloadError> {
        Ok(())
    }

    /// Unwind before the worker exits.
    fn stop(&mut self) {}
}

/// Look up a built-in payload.
pub fn payload_by_name(name: &str) -> MasterResult<Box<dyn Payload>> {
    match name {
        "idle" => Ok(Box::new(Idle)),
        "echo" => Ok(Box::new(Echo::default())),
        _ => Err(MasterError::UnknownPayload { name: name.to_string() }),
    }
}

/// Does nothing; the work loop's heartbeat is the whole job.
#[derive(Debug, Default, Clone, Copy)]
pub struct Idle;

impl Payload for Idle {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn work(&mut self, _pool: &PuppetSpec, _worker: &Worker) -> Result<(), PayloadError> {
        Ok(())
    }
}

/// Accepts connections on the pool's listeners and echoes one line back.
#[derive(Debug, Default)]
pub struct Echo {
    listeners: Vec<Listener>,
    served: u64,
}

const ECHO_READ_TIMEOUT: Duration = Duration::from_secs(1);

impl Echo {
    pub fn served(&self) -> u64 {
        self.served
    }

    fn drain_accepts(&mut self, only: Option<RawFd>) -> io::Result<()> {
        for listener in self.listeners.iter().filter(|l| only.is_none_or(|fd| l.fd() == fd)) {
            loop {
                match listener.accept() {
                    Ok(conn) => {
                        serve_line(conn)?;
                        self.served += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn serve_line(conn: socket2::Socket) -> io::Result<()> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(ECHO_READ_TIMEOUT))?;
    let mut line = String::new();
    match BufReader::new(&conn).read_line(&mut line) {
        Ok(_) => {
            (&conn).write_all(line.as_bytes())?;
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            debug!("echo client sent nothing");
        }
        Err(e) => return Err(e),
    }
    let _ = conn.shutdown(Shutdown::Both);
    Ok(())
}

impl Payload for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn setup(&mut self, pool: &PuppetSpec, listeners: Vec<Listener>) -> Result<(), PayloadError> {
        if listeners.is_empty() {
            return Err(format!("echo payload of pool {} has no listeners", pool.display_key()).into());
        }
        for listener in &listeners {
            listener.set_nonblocking(true)?;
        }
        self.listeners = listeners;
        Ok(())
    }

    fn work(&mut self, _pool: &PuppetSpec, _worker: &Worker) -> Result<(), PayloadError> {
        Ok(self.drain_accepts(None)?)
    }

    fn watched_fds(&self) -> Vec<RawFd> {
        self.listeners.iter().map(Listener::fd).collect()
    }

    fn readable(&mut self, fd: RawFd, _pool: &PuppetSpec, _worker: &Worker) -> Result<(), PayloadError> {
        Ok(self.drain_accepts(Some(fd))?)
    }

    fn stop(&mut self) {
        self.listeners.clear();
    }
}
