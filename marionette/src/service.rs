//! Supervised auxiliary processes.
//!
//! A [`Service`] is a single external command (a datastore, a cache) that
//! the master forks, health-checks and restarts next to the worker pools.
//! Ports come from a reserved set owned by the master; auto-allocated ports
//! go back to it when the service dies.

use crate::error::{MasterError, MasterResult};
use crate::process_utils::{is_process_alive, send_signal};
use crate::signals::parse_signal;
use crate::socket::find_available_port;
use marionette_common::config::ServiceSection;
use marionette_common::consts::SERVICE_PORT_RANGE;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Time a fresh service gets before its health check counts.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Connect timeout of the health check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Service {
    name: String,
    command: Vec<String>,
    listen_host: String,
    fixed_port: Option<u16>,
    listen_port: Option<u16>,
    stop_signal: Signal,
    health_check: bool,
    disabled: bool,
    service_id: Option<String>,
    pid: Option<Pid>,
    alive: bool,
    started_at: Option<Instant>,
    client: Option<TcpStream>,
}

impl Service {
    /// Build from a `[[service]]` entry.
    pub fn from_section(section: &ServiceSection) -> MasterResult<Self> {
        let stop_signal = parse_signal(&section.stop_signal).ok_or_else(|| MasterError::UnknownSignal {
            name: section.stop_signal.clone(),
        })?;
        Ok(Self {
            name: section.name.clone(),
            command: section.command.clone(),
            listen_host: section.listen_host.clone(),
            fixed_port: section.listen_port,
            listen_port: section.listen_port,
            stop_signal,
            health_check: section.health_check,
            disabled: section.disabled,
            service_id: None,
            pid: None,
            alive: false,
            started_at: None,
            client: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn alive(&self) -> bool {
        self.alive
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn listen_host(&self) -> &str {
        &self.listen_host
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// Bind the service to its master. Fixed ports are reserved for good.
    pub fn boot(&mut self, program: &str, master_pid: Pid, reserved: &mut BTreeSet<u16>) {
        self.service_id = Some(format!("{program}-{master_pid}-{}", self.name));
        if let Some(port) = self.fixed_port {
            reserved.insert(port);
        }
    }

    /// `<program>-<master pid>-<name>`; just the name before boot.
    pub fn service_id(&self) -> &str {
        self.service_id.as_deref().unwrap_or(&self.name)
    }

    fn service_id_path_safe(&self) -> String {
        self.service_id().replace(['/', '.'], "-")
    }

    /// Pid file path handed to the command as `{pid_file}`.
    pub fn pid_file(&self) -> PathBuf {
        env::temp_dir().join(format!("{}.pid", self.service_id_path_safe()))
    }

    pub fn sock_file(&self) -> PathBuf {
        env::temp_dir().join(format!("{}.sock", self.service_id_path_safe()))
    }

    pub fn log_file(&self) -> PathBuf {
        env::temp_dir().join(format!("{}.log", self.service_id_path_safe()))
    }

    /// Get ready to fork: pick a port if none is fixed and reserve it.
    pub fn prepare_start(&mut self, reserved: &mut BTreeSet<u16>) -> MasterResult<()> {
        let port = match self.listen_port {
            Some(port) => port,
            None => find_available_port(&self.listen_host, SERVICE_PORT_RANGE, reserved)?,
        };
        reserved.insert(port);
        self.listen_port = Some(port);
        self.cleanup_temporary_files();
        warn!("{} listening on: {}:{port}", self.name, self.listen_host);
        Ok(())
    }

    /// Command line with `{host}`, `{port}`, `{pid_file}` and `{name}` substituted.
    pub fn command(&self) -> Vec<String> {
        let port = self.listen_port.map(|p| p.to_string()).unwrap_or_default();
        let pid_file = self.pid_file().display().to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{host}", &self.listen_host)
                    .replace("{port}", &port)
                    .replace("{pid_file}", &pid_file)
                    .replace("{name}", &self.name)
            })
            .collect()
    }

    /// Record the forked child.
    pub fn started(&mut self, pid: Pid) {
        self.pid = Some(pid);
        self.alive = true;
        self.started_at = Some(Instant::now());
    }

    /// Process liveness plus the optional protocol check.
    ///
    /// A failed check counts as death: the process gets KILL and stays
    /// recorded until reaped, so the service is restarted only once.
    pub fn check_alive(&mut self) -> bool {
        let Some(pid) = self.pid else {
            self.alive = false;
            return false;
        };
        if !is_process_alive(pid) {
            self.mark_dead();
            return false;
        }
        if !self.alive {
            return false;
        }
        if self.health_check && self.past_grace() && !self.service_test() {
            warn!("service={} PID:{pid} failed its health check, killing", self.name);
            self.alive = false;
            if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                error!("failed to kill service={}: {e}", self.name);
            }
            return false;
        }
        true
    }

    /// Whether a dead service should be started by routine maintenance.
    pub fn needs_start(&self) -> bool {
        !self.disabled && self.pid.is_none()
    }

    fn past_grace(&self) -> bool {
        self.started_at.is_some_and(|t| t.elapsed() >= STARTUP_GRACE)
    }

    fn addr(&self) -> Option<SocketAddr> {
        let port = self.listen_port?;
        (self.listen_host.as_str(), port).to_socket_addrs().ok()?.next()
    }

    /// TCP connect check.
    pub fn service_test(&self) -> bool {
        self.addr()
            .is_some_and(|addr| TcpStream::connect_timeout(&addr, CHECK_TIMEOUT).is_ok())
    }

    /// Handle a reaped pid. Returns whether it was this service.
    pub fn reap(&mut self, pid: Pid, status: &WaitStatus, reserved: &mut BTreeSet<u16>) -> bool {
        if self.pid != Some(pid) {
            return false;
        }
        warn!("reaped {status:?} service={}", self.name);
        self.mark_dead();
        self.cleanup_temporary_files();
        if self.fixed_port.is_none()
            && let Some(port) = self.listen_port.take()
        {
            reserved.remove(&port);
        }
        true
    }

    /// Send `signal`; a vanished process is marked dead.
    pub fn kill(&mut self, signal: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        match send_signal(pid, signal) {
            Ok(true) => debug!("sent {signal} to service={} PID:{pid}", self.name),
            Ok(false) => self.mark_dead(),
            Err(e) => error!("failed to send {signal} to service={}: {e}", self.name),
        }
    }

    /// Send the configured stop signal.
    pub fn stop(&mut self) {
        self.kill(self.stop_signal);
    }

    pub fn mark_dead(&mut self) {
        self.pid = None;
        self.alive = false;
        self.started_at = None;
    }

    /// Client connection, connected on first use.
    pub fn client(&mut self) -> io::Result<&mut TcpStream> {
        if self.disabled {
            return Err(io::Error::other(format!("service {} is disabled", self.name)));
        }
        let not_connected = || io::Error::new(io::ErrorKind::NotConnected, "service has no address");
        if self.client.is_none() {
            let addr = self.addr().ok_or_else(not_connected)?;
            warn!("{} client connect: {addr}", self.name);
            self.client = Some(TcpStream::connect_timeout(&addr, CHECK_TIMEOUT)?);
        }
        self.client.as_mut().ok_or_else(not_connected)
    }

    /// Drop the client and connect again.
    pub fn client_reset(&mut self) -> io::Result<&mut TcpStream> {
        self.close();
        self.client()
    }

    /// Forget the client connection; the next use reconnects. Runs after fork.
    pub fn reset(&mut self) {
        self.client = None;
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.client.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn cleanup_temporary_files(&self) {
        for path in [self.sock_file(), self.pid_file(), self.log_file()] {
            if path.exists()
                && let Err(e) = fs::remove_file(&path)
            {
                debug!("could not remove {}: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;
    use std::net::TcpListener;

    fn section(name: &str) -> ServiceSection {
        ServiceSection {
            name: name.to_string(),
            command: vec![
                "server".into(),
                "--bind={host}:{port}".into(),
                "--pidfile".into(),
                "{pid_file}".into(),
                "{name}".into(),
            ],
            listen_host: "127.0.0.1".into(),
            listen_port: None,
            stop_signal: "QUIT".into(),
            health_check: false,
            disabled: false,
        }
    }

    #[test]
    fn test_unknown_stop_signal() {
        let mut bad = section("cache");
        bad.stop_signal = "BOGUS".into();
        assert!(matches!(
            Service::from_section(&bad),
            Err(MasterError::UnknownSignal { .. })
        ));
    }

    #[test]
    fn test_service_id_and_paths() {
        let mut service = Service::from_section(&section("cache")).unwrap();
        assert_eq!(service.service_id(), "cache");

        let mut reserved = BTreeSet::new();
        service.boot("marionette.bin", Pid::from_raw(42), &mut reserved);
        assert_eq!(service.service_id(), "marionette.bin-42-cache");
        assert!(
            service
                .pid_file()
                .ends_with("marionette-bin-42-cache.pid")
        );
        assert!(reserved.is_empty());
    }

    #[test]
    fn test_command_substitution() {
        let mut service = Service::from_section(&section("cache")).unwrap();
        let mut reserved = BTreeSet::new();
        service.boot("m", getpid(), &mut reserved);
        service.prepare_start(&mut reserved).unwrap();

        let port = service.listen_port().unwrap();
        assert!((SERVICE_PORT_RANGE.0..SERVICE_PORT_RANGE.1).contains(&port));
        assert!(reserved.contains(&port));

        let command = service.command();
        assert_eq!(command[1], format!("--bind=127.0.0.1:{port}"));
        assert_eq!(command[3], service.pid_file().display().to_string());
        assert_eq!(command[4], "cache");
    }

    #[test]
    fn test_reap_releases_auto_port_only() {
        let mut reserved = BTreeSet::new();

        let mut auto = Service::from_section(&section("auto")).unwrap();
        auto.prepare_start(&mut reserved).unwrap();
        let pid = Pid::from_raw(900_100);
        auto.started(pid);
        assert!(auto.reap(pid, &WaitStatus::Exited(pid, 0), &mut reserved));
        assert!(reserved.is_empty());
        assert!(auto.needs_start());

        let mut fixed_section = section("fixed");
        fixed_section.listen_port = Some(44_999);
        let mut fixed = Service::from_section(&fixed_section).unwrap();
        fixed.boot("m", getpid(), &mut reserved);
        fixed.prepare_start(&mut reserved).unwrap();
        fixed.started(pid);
        assert!(!fixed.reap(Pid::from_raw(1), &WaitStatus::Exited(pid, 0), &mut reserved));
        assert!(fixed.reap(pid, &WaitStatus::Exited(pid, 0), &mut reserved));
        assert!(reserved.contains(&44_999));
    }

    #[test]
    fn test_disabled_never_needs_start() {
        let mut service = Service::from_section(&section("cache")).unwrap();
        assert!(service.needs_start());
        service.set_disabled(true);
        assert!(!service.needs_start());
        assert!(service.client().is_err());
    }

    #[test]
    fn test_check_alive_without_pid() {
        let mut service = Service::from_section(&section("cache")).unwrap();
        assert!(!service.check_alive());
        assert!(!service.alive());
    }

    #[test]
    fn test_service_test_connects_to_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut with_port = section("checked");
        with_port.listen_port = Some(listener.local_addr().unwrap().port());
        let mut service = Service::from_section(&with_port).unwrap();
        assert!(service.service_test());
        assert!(service.client().is_ok());
        assert!(service.client_reset().is_ok());

        drop(listener);
        service.close();
        assert!(!service.service_test());
    }
}
