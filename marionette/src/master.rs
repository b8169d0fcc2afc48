//! The master process.
//!
//! Owns the family, the services and the listeners, and runs a single-threaded
//! loop: reap dead children, handle at most one queued signal (or do routine
//! maintenance when none is queued), fork what was requested, then nap on the
//! self-pipe until a signal, a child exit, a control-port client or the nap
//! timer wakes it up.
//!
//! Forking never happens in the middle of an operation. Puppets and services
//! push [`ForkHandler`]s onto the [`ForkQueue`]; the loop pops them and forks.
//! In the child the handler leaves the loop and the process becomes a worker
//! or a service; it never returns into the master loop.

use crate::callbacks::{Callbacks, Hook, HookEvent};
use crate::control_port::{ControlPort, WorkerStat, format_stats};
use crate::error::{MasterError, MasterResult};
use crate::family::Family;
use crate::logging::LogSink;
use crate::process_utils::{PidFile, has_exited, is_daemonized, is_process_alive, send_signal, set_proc_name};
use crate::puppet::Puppet;
use crate::runtime::{Runtime, StartContext};
use crate::service::Service;
use crate::signals::{
    MasterSignal, SelfPipe, SignalHandlers, SignalQueue, block_trapped, reset_to_default, restore_mask,
};
use crate::socket::Listeners;
use crate::worker::Worker;
use marionette_common::config::{ConfigError, MasterConfig, ServiceSection, SocketSection};
use marionette_common::consts::{KILL_STEP_MS, MATRICIDE_TIMEOUT_SECS, commit_matricide_env_var, fd_env_var};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

const KILL_STEP: Duration = Duration::from_millis(KILL_STEP_MS);

// ─── Fork queue ─────────────────────────────────────────────────────

/// A pending fork, and in the child the role the new process takes.
#[derive(Debug)]
pub enum ForkHandler {
    /// Worker `worker` of pool `pool` (`None` for the main puppet).
    Worker { pool: Option<String>, worker: Worker },
    /// The service with this name.
    Service(String),
}

/// Forks requested since the last loop iteration, oldest first.
#[derive(Debug, Default)]
pub struct ForkQueue {
    queue: VecDeque<ForkHandler>,
}

impl ForkQueue {
    pub fn push(&mut self, handler: ForkHandler) {
        self.queue.push_back(handler);
    }

    /// Queue ahead of everything else. Services go first.
    pub fn unshift(&mut self, handler: ForkHandler) {
        self.queue.push_front(handler);
    }

    pub fn pop(&mut self) -> Option<ForkHandler> {
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

    /// Whether worker `nr` of `pool` is already waiting to be forked.
    pub fn has_worker(&self, pool: Option<&str>, nr: usize) -> bool {
        self.queue.iter().any(|h| match h {
            ForkHandler::Worker { pool: p, worker } => p.as_deref() == pool && worker.nr() == nr,
            ForkHandler::Service(_) => false,
        })
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.queue
            .iter()
            .any(|h| matches!(h, ForkHandler::Service(n) if n == name))
    }
}

// ─── Settings ───────────────────────────────────────────────────────

/// Master tunables, resolved from the configuration and the command line.
#[derive(Debug, Clone)]
pub struct MasterSettings {
    /// Worker staleness threshold and shutdown deadline.
    pub timeout: Duration,
    /// Longest nap between two loop iterations.
    pub nap_time: Duration,
    pub proc_tag: Option<String>,
    pub pid_file: Option<PathBuf>,
    pub control_port: Option<PathBuf>,
    /// Listener key to listener specs.
    pub listen: BTreeMap<String, Vec<String>>,
    pub socket: SocketSection,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self::from(&MasterConfig::default())
    }
}

impl From<&MasterConfig> for MasterSettings {
    fn from(config: &MasterConfig) -> Self {
        Self {
            timeout: config.timeout(),
            nap_time: config.nap_time(),
            proc_tag: config.master.proc_tag.clone(),
            pid_file: config.master.pid_file.clone(),
            control_port: config.master.control_port.clone(),
            listen: config.listen.clone(),
            socket: config.socket.clone(),
        }
    }
}

// ─── Master ─────────────────────────────────────────────────────────

/// How a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// QUIT/INT: workers finish their current unit of work.
    Graceful,
    /// TERM: workers exit at once.
    Immediate,
}

impl StopMode {
    fn worker_signal(self) -> Signal {
        match self {
            StopMode::Graceful => Signal::SIGQUIT,
            StopMode::Immediate => Signal::SIGTERM,
        }
    }
}

/// Outcome of one loop iteration.
#[derive(Debug)]
pub enum LoopState {
    Running,
    Stopped,
    /// We are a freshly forked child and must leave the loop.
    Unjoin(ForkHandler),
}

/// A predecessor sent QUIT, awaiting its exit.
#[derive(Debug, Clone, Copy)]
struct Matricide {
    pid: Option<Pid>,
    since: Instant,
    killed: bool,
}

type ResetHook = Box<dyn FnMut(&Worker)>;
type ShutdownHook = Box<dyn FnMut()>;

pub struct Master {
    settings: MasterSettings,
    sink: LogSink,
    start_ctx: StartContext,
    started_at: Instant,
    master_pid: Pid,
    family: Option<Family>,
    services: BTreeMap<String, Service>,
    reserved_ports: BTreeSet<u16>,
    listeners: Listeners,
    signals: SignalQueue,
    // Declared before `pipe`: handlers must go before the pipe they write to.
    handlers: Option<SignalHandlers>,
    pipe: Option<SelfPipe>,
    forks: ForkQueue,
    respawn: bool,
    stopped: Option<StopMode>,
    reexec_pid: Option<Pid>,
    pid_file: Option<PidFile>,
    callbacks: Callbacks,
    control_port: Option<ControlPort>,
    reset_app: Vec<ResetHook>,
    shutdown_app: Vec<ShutdownHook>,
    matricide: Rc<Cell<Option<Matricide>>>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("pid", &self.master_pid)
            .field("family", &self.family)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners)
            .field("respawn", &self.respawn)
            .field("stopped", &self.stopped)
            .field("reexec_pid", &self.reexec_pid)
            .finish()
    }
}

impl Master {
    pub fn new(settings: MasterSettings, sink: LogSink, start_ctx: StartContext) -> Self {
        Self {
            settings,
            sink,
            start_ctx,
            started_at: Instant::now(),
            master_pid: getpid(),
            family: None,
            services: BTreeMap::new(),
            reserved_ports: BTreeSet::new(),
            listeners: Listeners::new(),
            signals: SignalQueue::new(),
            handlers: None,
            pipe: None,
            forks: ForkQueue::default(),
            respawn: true,
            stopped: None,
            reexec_pid: None,
            pid_file: None,
            callbacks: Callbacks::new(),
            control_port: None,
            reset_app: Vec::new(),
            shutdown_app: Vec::new(),
            matricide: Rc::new(Cell::new(None)),
        }
    }

    /// Master for this process, sharing the runtime's log sink and start context.
    pub fn with_runtime(settings: MasterSettings, runtime: &Runtime) -> Self {
        let mut master = Self::new(settings, runtime.sink().clone(), runtime.start_ctx().clone());
        master.started_at = runtime.started_at();
        master
    }

    /// Build the master, its family and its services from a loaded configuration.
    ///
    /// The configuration is validated first; an invalid one is a
    /// `MasterError::Config`.
    pub fn from_config(config: &MasterConfig, runtime: &Runtime) -> MasterResult<Self> {
        config.validate()?;
        let mut master = Self::with_runtime(MasterSettings::from(config), runtime);

        let mut family = Family::new();
        for section in &config.puppets {
            family.add(Puppet::from_section(section)?)?;
        }
        master.set_family(family);

        for section in &config.services {
            master.use_service(section)?;
        }
        Ok(master)
    }

    pub fn set_family(&mut self, family: Family) {
        self.family = Some(family);
    }

    /// Register a service. Names are unique.
    pub fn use_service(&mut self, section: &ServiceSection) -> MasterResult<()> {
        if self.services.contains_key(&section.name) {
            return Err(MasterError::ServiceExists {
                name: section.name.clone(),
            });
        }
        let service = Service::from_section(section)?;
        self.services.insert(section.name.clone(), service);
        Ok(())
    }

    /// Run `hook` in every new worker during init.
    pub fn on_reset_application(&mut self, hook: impl FnMut(&Worker) + 'static) {
        self.reset_app.push(Box::new(hook));
    }

    /// Run `hook` in a service child right before it execs.
    pub fn on_shutdown_application(&mut self, hook: impl FnMut() + 'static) {
        self.shutdown_app.push(Box::new(hook));
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn pid(&self) -> Pid {
        self.master_pid
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    pub fn family(&self) -> Option<&Family> {
        self.family.as_ref()
    }

    pub fn family_mut(&mut self) -> Option<&mut Family> {
        self.family.as_mut()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    pub fn reserved_ports(&self) -> &BTreeSet<u16> {
        &self.reserved_ports
    }

    pub fn respawn(&self) -> bool {
        self.respawn
    }

    pub fn stopped(&self) -> Option<StopMode> {
        self.stopped
    }

    pub fn reexec_pid(&self) -> Option<Pid> {
        self.reexec_pid
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_ref().map(PidFile::path)
    }

    pub fn forks(&self) -> &ForkQueue {
        &self.forks
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Queue a signal as if it had been delivered. Returns false when the queue is full.
    pub fn queue_signal(&mut self, signal: MasterSignal) -> bool {
        let queued = self.signals.push(signal);
        if let Some(pipe) = self.pipe.as_ref() {
            pipe.wake();
        }
        queued
    }

    pub fn pending_signals(&self) -> usize {
        self.signals.len()
    }

    // ─── Startup ────────────────────────────────────────────────────

    /// Create or inherit listeners, install signal handlers, boot services
    /// and build the family. After this the master is ready to [`join`](Self::join).
    ///
    /// # Errors
    ///
    /// `MasterError::NoFamily` or `MasterError::NoMainPuppet` when the family
    /// is unusable; these are fatal and the process must not serve.
    pub fn start(&mut self) -> MasterResult<()> {
        self.resolve_listeners()?;

        let family = self.family.as_ref().ok_or(MasterError::NoFamily)?;
        if family.main_puppet().is_none() {
            return Err(MasterError::NoMainPuppet);
        }
        for puppet in family.puppets() {
            if let Some(key) = puppet.spec().listen()
                && !self.listeners.contains(key)
            {
                return Err(ConfigError::ValidationError(format!(
                    "puppet {} listens on unknown listener key '{key}'",
                    puppet.spec().display_key()
                ))
                .into());
            }
        }

        let pipe = SelfPipe::new()?;
        self.handlers = Some(SignalHandlers::install(&pipe)?);
        self.pipe = Some(pipe);

        self.set_proc_name(&self.master_title());

        if let Some(path) = self.settings.pid_file.clone() {
            let pid_file = PidFile::new(path);
            pid_file.write()?;
            self.pid_file = Some(pid_file);
        }

        if let Some(path) = self.settings.control_port.clone() {
            self.control_port = Some(ControlPort::open(&path)?);
        }

        let program = self.start_ctx.program_name();
        for service in self.services.values_mut() {
            service.boot(&program, self.master_pid, &mut self.reserved_ports);
        }
        if let Some(family) = self.family.as_mut() {
            family.build(self.master_pid);
        }

        if env::var_os(commit_matricide_env_var()).is_some_and(|v| v == "1") {
            self.plan_matricide();
        }

        info!("master started: {}", self.master_pid);
        Ok(())
    }

    /// Inherited listeners win over configured ones.
    fn resolve_listeners(&mut self) -> MasterResult<()> {
        if let Ok(encoded) = env::var(fd_env_var())
            && !encoded.is_empty()
        {
            let inherited = Listeners::inherit(&encoded)?;
            if !inherited.is_empty() {
                inherited.set_inheritable(false)?;
                info!("inherited listeners: {encoded}");
                self.listeners = inherited;
                return Ok(());
            }
        }

        let listen = self.settings.listen.clone();
        for (key, specs) in &listen {
            self.listeners.init(key, specs, &self.settings.socket)?;
        }
        Ok(())
    }

    fn master_title(&self) -> String {
        match self.settings.proc_tag.as_deref() {
            Some(tag) => format!("master[{tag}]"),
            None => "master".to_string(),
        }
    }

    pub fn set_proc_name(&self, name: &str) {
        set_proc_name(name);
    }

    // ─── Main loop ──────────────────────────────────────────────────

    /// Run the loop until the master stops.
    ///
    /// In a forked child this never returns: the process becomes the worker
    /// or service it was forked for and exits from there.
    pub fn join(&mut self) -> MasterResult<()> {
        loop {
            match self.do_some_work() {
                Ok(LoopState::Running) => {}
                Ok(LoopState::Stopped) => break,
                Ok(LoopState::Unjoin(handler)) => self.unjoin(handler),
                Err(e) => error!("master loop error: {e}"),
            }
        }
        self.finish()
    }

    /// One loop iteration.
    pub fn do_some_work(&mut self) -> MasterResult<LoopState> {
        self.collect_signals();
        self.reap_dead_children();

        match self.signals.pop() {
            Some(signal) => self.dispatch(signal)?,
            None => self.routine_maintenance()?,
        }
        if self.stopped.is_some() {
            return Ok(LoopState::Stopped);
        }

        let (forked, handler) = self.perform_forks()?;
        if let Some(handler) = handler {
            return Ok(LoopState::Unjoin(handler));
        }
        if !forked && self.signals.is_empty() {
            self.nap()?;
        }
        Ok(LoopState::Running)
    }

    fn dispatch(&mut self, signal: MasterSignal) -> MasterResult<()> {
        warn!("received signal {}", signal.name());
        match signal {
            MasterSignal::Quit | MasterSignal::Int => self.stop(StopMode::Graceful),
            MasterSignal::Term => self.stop(StopMode::Immediate),
            MasterSignal::Usr1 => self.reexec(false)?,
            MasterSignal::Usr2 => self.reexec(true)?,
            MasterSignal::Winch => {
                if is_daemonized() {
                    warn!("gracefully stopping all workers");
                    self.respawn = false;
                    if let Some(family) = self.family.as_mut() {
                        family.kill_each_workers(Signal::SIGQUIT);
                    }
                    for service in self.services.values_mut() {
                        service.kill(Signal::SIGQUIT);
                    }
                } else {
                    info!("SIGWINCH ignored: not daemonized");
                }
            }
            MasterSignal::Hup => {
                info!("respawn enabled");
                self.respawn = true;
            }
            MasterSignal::Ttin | MasterSignal::Ttou => {
                if let Some(puppet) = self.family.as_mut().and_then(Family::main_puppet_mut) {
                    let count = match signal {
                        MasterSignal::Ttin => puppet.count() + 1,
                        _ => puppet.count().saturating_sub(1),
                    };
                    puppet.set_count(count);
                    info!("main puppet count is now {count}");
                }
            }
        }
        Ok(())
    }

    fn routine_maintenance(&mut self) -> MasterResult<()> {
        let timeout = self.settings.timeout;
        if let Some(family) = self.family.as_mut() {
            family.murder_lazy_workers(timeout);
        }
        self.maintain_services()?;
        if self.respawn
            && let Some(family) = self.family.as_mut()
        {
            family.maintain_workers(&mut self.forks)?;
        }

        let checked_in = self
            .family
            .as_ref()
            .and_then(Family::main_puppet)
            .is_some_and(Puppet::all_workers_checked_in);
        if checked_in {
            self.callbacks.fire(Hook::AllWorkersCheckedIn, HookEvent::CheckedIn);
        }
        self.watch_predecessor();
        Ok(())
    }

    /// Queue a start for every dead service that is not disabled.
    pub fn maintain_services(&mut self) -> MasterResult<()> {
        for service in self.services.values_mut() {
            if service.check_alive() || !service.needs_start() || self.forks.has_service(service.name()) {
                continue;
            }
            service.prepare_start(&mut self.reserved_ports)?;
            self.forks.unshift(ForkHandler::Service(service.name().to_string()));
        }
        Ok(())
    }

    /// Reap every exited child without blocking.
    pub fn reap_dead_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => self.child_reaped(pid, &status),
                    None => break,
                },
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("waitpid failed: {e}");
                    break;
                }
            }
        }
    }

    fn child_reaped(&mut self, pid: Pid, status: &WaitStatus) {
        if self.reexec_pid == Some(pid) {
            error!("reexec'd master PID:{pid} died: {status:?}");
            self.reexec_pid = None;
            self.set_proc_name(&self.master_title());
        }

        let mut owned = self.family.as_mut().is_some_and(|f| f.reap(pid, status));
        for service in self.services.values_mut() {
            owned |= service.reap(pid, status, &mut self.reserved_ports);
        }
        if !owned {
            debug!("reaped unknown child PID:{pid}: {status:?}");
        }
        self.callbacks.fire(Hook::ReapDeadChildren, HookEvent::Reaped { pid: pid.as_raw() });
    }

    /// Fork everything queued. Returns whether anything was forked, and in
    /// the child the handler it was forked for.
    ///
    /// Trapped signals stay blocked across each fork. The child swaps the
    /// master's actions for its own before they are unblocked, so a signal
    /// sent to a brand new child never lands in the master's self-pipe.
    pub fn perform_forks(&mut self) -> MasterResult<(bool, Option<ForkHandler>)> {
        let mut forked = false;
        while let Some(handler) = self.forks.pop() {
            if let ForkHandler::Worker { pool, worker } = &handler
                && let Some(puppet) = self.family.as_mut().and_then(|f| f.get_mut(pool.as_deref()))
            {
                puppet.before_fork(worker);
            }

            let mask = block_trapped()?;
            // SAFETY: the master is single-threaded; the child leaves the
            // loop and only touches state it owns.
            let fork_result = unsafe { fork() };
            if let Ok(ForkResult::Child) = fork_result {
                self.enter_child(&handler, &mask);
                return Ok((true, Some(handler)));
            }
            restore_mask(&mask)?;

            let ForkResult::Parent { child } = fork_result? else {
                continue;
            };
            match handler {
                ForkHandler::Worker { pool, worker } => {
                    info!("spawned worker={} PID:{child}", worker.proc_tag());
                    if let Some(family) = self.family.as_mut() {
                        family.adopt(pool.as_deref(), child, worker);
                    }
                }
                ForkHandler::Service(name) => {
                    info!("spawned service={name} PID:{child}");
                    if let Some(service) = self.services.get_mut(&name) {
                        service.started(child);
                    }
                }
            }
            forked = true;
        }
        Ok((forked, None))
    }

    /// Child side of a fork, signals still blocked.
    ///
    /// Workers trap QUIT/INT/TERM for themselves; services get default
    /// dispositions ahead of exec. Failure here leaves the child unusable.
    fn enter_child(&mut self, handler: &ForkHandler, mask: &SigSet) {
        self.handlers = None;
        self.pipe = None;

        let prepared = match handler {
            ForkHandler::Worker { worker, .. } => worker.trap_signals().map_err(MasterError::from),
            ForkHandler::Service(_) => reset_to_default().map_err(MasterError::from),
        };
        if let Err(e) = prepared.and_then(|()| restore_mask(mask).map_err(MasterError::from)) {
            error!("child PID:{} signal setup failed: {e}", getpid());
            std::process::exit(1);
        }
    }

    /// Pull whatever the signal handlers wrote into the queue.
    fn collect_signals(&mut self) {
        let Some(pipe) = self.pipe.as_ref() else {
            return;
        };
        for signum in pipe.drain() {
            // 0 is a SIGCHLD wakeup; reaping happens every iteration anyway.
            if signum == 0 {
                continue;
            }
            match MasterSignal::from_raw(signum) {
                Some(signal) => {
                    self.signals.push(signal);
                }
                None => debug!("ignoring signal {signum}"),
            }
        }
    }

    /// Wait for a wakeup: signal, child exit, control-port traffic or the nap timer.
    fn nap(&mut self) -> MasterResult<()> {
        let millis = u16::try_from(self.settings.nap_time.as_millis()).unwrap_or(u16::MAX);
        match self.pipe.as_ref() {
            Some(pipe) => {
                let mut fds = vec![PollFd::new(pipe.read_fd(), PollFlags::POLLIN)];
                if let Some(port) = self.control_port.as_ref() {
                    fds.extend(port.fds().into_iter().map(|fd| PollFd::new(fd, PollFlags::POLLIN)));
                }
                match poll(&mut fds, PollTimeout::from(millis)) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            None => thread::sleep(self.settings.nap_time),
        }

        self.collect_signals();
        self.serve_control_port();
        Ok(())
    }

    fn serve_control_port(&mut self) {
        if let Some(mut port) = self.control_port.take() {
            port.process(|| self.stats_report());
            self.control_port = Some(port);
        }
    }

    /// Text of the control port's `!stats` reply.
    pub fn stats_report(&self) -> String {
        let now = SystemTime::now();
        let age = |t: SystemTime| now.duration_since(t).unwrap_or_default();
        let workers: Vec<WorkerStat> = self
            .family
            .iter()
            .flat_map(Family::workers)
            .map(|(pid, worker)| WorkerStat {
                pid: *pid,
                uptime: age(worker.spawned_at()),
                last_ping: worker.heartbeat().last_change().map(&age).unwrap_or_default(),
            })
            .collect();
        format_stats(self.master_pid, self.started_at.elapsed(), &workers)
    }

    // ─── Shutdown ───────────────────────────────────────────────────

    /// Stop every worker and service, escalating to KILL after `timeout`,
    /// then close the listeners and the control port. Listener paths are
    /// kept on disk when a re-exec'd master is taking over.
    pub fn stop(&mut self, mode: StopMode) {
        if self.stopped.is_some() {
            return;
        }
        warn!("master stopping ({mode:?})");
        self.stopped = Some(mode);
        self.forks.clear();

        self.kill_all_workers(mode.worker_signal());
        self.kill_all_services(mode);

        let successor = self.reexec_pid.is_some_and(is_process_alive);
        self.listeners.close_all(!successor);
        if let Some(port) = self.control_port.take() {
            port.close(!successor);
        }
        warn!("master stopped");
    }

    /// Signal every worker, wait for them, KILL the stragglers after `timeout`.
    pub fn kill_all_workers(&mut self, signal: Signal) {
        let Some(family) = self.family.as_mut() else {
            return;
        };
        family.kill_each_workers(signal);

        self.wait_for_children(
            |m| m.family.as_ref().is_none_or(Family::all_workers_dead),
            |m| {
                if let Some(family) = m.family.as_mut() {
                    family.kill_each_workers(Signal::SIGKILL);
                }
            },
        );
    }

    /// Stop every service, wait for them, KILL the stragglers after `timeout`.
    pub fn kill_all_services(&mut self, mode: StopMode) {
        for service in self.services.values_mut() {
            match mode {
                StopMode::Graceful => service.stop(),
                StopMode::Immediate => service.kill(Signal::SIGTERM),
            }
        }

        self.wait_for_children(
            |m| m.services.values().all(|s| s.pid().is_none()),
            |m| {
                for service in m.services.values_mut() {
                    service.kill(Signal::SIGKILL);
                }
            },
        );
    }

    fn wait_for_children(&mut self, done: impl Fn(&Self) -> bool, escalate: impl Fn(&mut Self)) {
        let timeout = self.settings.timeout;
        let give_up = timeout.saturating_mul(2);
        let started = Instant::now();
        let mut killed = false;
        loop {
            self.reap_dead_children();
            if done(self) {
                return;
            }
            let waited = started.elapsed();
            if !killed && waited >= timeout {
                warn!("timeout ({}s) reached, sending KILL", timeout.as_secs());
                escalate(self);
                killed = true;
            } else if killed && waited >= give_up {
                error!("children still alive after KILL, giving up");
                return;
            }
            thread::sleep(KILL_STEP);
        }
    }

    /// Final cleanup once the loop is over.
    fn finish(&mut self) -> MasterResult<()> {
        self.handlers = None;
        self.pipe = None;
        if let Some(pid_file) = self.pid_file.as_ref() {
            pid_file.cleanup()?;
        }
        Ok(())
    }

    // ─── Re-exec ────────────────────────────────────────────────────

    /// Start a fresh copy of this program that inherits the listeners.
    ///
    /// With `commit` the successor kills this master once its own main
    /// puppet has every worker checked in. Refused while a previous
    /// successor is still running.
    pub fn reexec(&mut self, commit: bool) -> MasterResult<()> {
        if let Some(pid) = self.reexec_pid {
            if is_process_alive(pid) {
                error!("reexec refused: reexec'd master PID:{pid} is still running");
                return Ok(());
            }
            self.reexec_pid = None;
        }

        let successor_pid_file = self
            .pid_file
            .as_ref()
            .map(|p| PidFile::new(p.configured_path()).reexec_path());

        let mask = block_trapped()?;
        // SAFETY: the master is single-threaded; the child only builds a
        // command line and execs.
        let fork_result = unsafe { fork() };
        if !matches!(fork_result, Ok(ForkResult::Child)) {
            restore_mask(&mask)?;
        }
        match fork_result? {
            ForkResult::Parent { child } => {
                warn!("reexec'd master started: PID:{child} (commit: {commit})");
                self.reexec_pid = Some(child);
                self.set_proc_name(&format!("{} (old)", self.master_title()));
                Ok(())
            }
            ForkResult::Child => {
                self.handlers = None;
                self.pipe = None;
                if let Err(e) = reset_to_default().and_then(|()| restore_mask(&mask)) {
                    error!("reexec signal setup failed: {e}");
                    std::process::exit(1)
                }
                let err = self.exec_successor(commit, successor_pid_file);
                error!("reexec failed: {err}");
                std::process::exit(1)
            }
        }
    }

    fn exec_successor(&mut self, commit: bool, pid_file: Option<PathBuf>) -> io::Error {
        if let Err(e) = self.listeners.set_inheritable(true) {
            return e;
        }

        let ctx = &self.start_ctx;
        let program = Path::new(&ctx.program);
        let program = if program.is_relative() && program.components().count() > 1 {
            ctx.cwd.join(program)
        } else {
            program.to_path_buf()
        };

        let mut cmd = Command::new(program);
        cmd.args(&ctx.args);
        if let Some(path) = pid_file {
            cmd.arg("--pid-file").arg(path);
        }
        cmd.current_dir(&ctx.cwd).env(fd_env_var(), self.listeners.encode());
        if commit {
            cmd.env(commit_matricide_env_var(), "1");
        } else {
            cmd.env_remove(commit_matricide_env_var());
        }
        cmd.exec()
    }

    /// Send QUIT to the predecessor once our main puppet is fully checked in.
    ///
    /// The callback only signals; [`Self::watch_predecessor`] follows up on
    /// later maintenance ticks.
    fn plan_matricide(&mut self) {
        let Some(pid_file) = self.pid_file.as_ref() else {
            warn!("matricide requested without a pid file, predecessor left alone");
            return;
        };
        let predecessor = PidFile::new(pid_file.configured_path());
        let pending = Rc::clone(&self.matricide);
        info!("predecessor in {} dies once all workers check in", predecessor.path().display());

        self.callbacks.register(Hook::AllWorkersCheckedIn, 1, move |_| {
            warn!("all workers checked in, sending QUIT to predecessor");
            let pid = match predecessor.send_signal(Signal::SIGQUIT) {
                Ok(Some(pid)) => Some(pid),
                Ok(None) => {
                    warn!("no predecessor recorded in {}", predecessor.path().display());
                    None
                }
                Err(e) => {
                    error!("failed to signal predecessor: {e}");
                    None
                }
            };
            pending.set(Some(Matricide {
                pid,
                since: Instant::now(),
                killed: false,
            }));
        });
    }

    /// Follow up on a QUIT sent to the predecessor without blocking the loop.
    ///
    /// KILL goes out once after [`MATRICIDE_TIMEOUT_SECS`]; the configured
    /// pid file is taken over when the predecessor is gone.
    fn watch_predecessor(&mut self) {
        let Some(mut matricide) = self.matricide.get() else {
            return;
        };
        if let Some(pid) = matricide.pid
            && !has_exited(pid)
        {
            if !matricide.killed && matricide.since.elapsed() >= Duration::from_secs(MATRICIDE_TIMEOUT_SECS) {
                warn!("predecessor PID:{pid} still running after {MATRICIDE_TIMEOUT_SECS}s, sending KILL");
                if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                    error!("failed to kill predecessor PID:{pid}: {e}");
                }
                matricide.killed = true;
                self.matricide.set(Some(matricide));
            }
            return;
        }

        if let Some(pid) = matricide.pid {
            warn!("predecessor PID:{pid} terminated");
        }
        self.matricide.set(None);
        self.take_configured_pid_file();
    }

    /// After matricide our pid file moves to the configured path.
    fn take_configured_pid_file(&mut self) {
        let Some(pid_file) = self.pid_file.as_mut() else {
            return;
        };
        let dest = pid_file.configured_path();
        if dest == pid_file.path() {
            return;
        }
        match pid_file.rename(&dest) {
            Ok(()) => info!("pid file moved to {}", dest.display()),
            Err(e) => error!("could not move pid file to {}: {e}", dest.display()),
        }
    }

    // ─── Child side ─────────────────────────────────────────────────

    fn unjoin(&mut self, handler: ForkHandler) -> ! {
        let code = match handler {
            ForkHandler::Worker { pool, worker } => self.become_worker(pool.as_deref(), worker),
            ForkHandler::Service(name) => self.become_service(&name),
        };
        std::process::exit(code)
    }

    /// Turn this freshly forked child into `worker` and run its loop.
    /// Returns the exit code.
    pub fn become_worker(&mut self, pool: Option<&str>, worker: Worker) -> i32 {
        let Some(mut puppet) = self.family.as_mut().and_then(|f| f.take(pool)) else {
            error!("worker {} has no puppet", worker.proc_tag());
            return 1;
        };
        if let Err(e) = worker.init(self, &mut puppet) {
            error!("worker {} init failed: {e}", worker.proc_tag());
            return 1;
        }
        let listeners = puppet
            .spec()
            .listen()
            .map(|key| self.listeners.take(key))
            .unwrap_or_default();
        self.listeners.close_all(false);

        puppet.work_loop(worker, listeners);
        0
    }

    /// Exec the command of service `name` in this freshly forked child.
    /// Returns only on failure, with the exit code.
    pub fn become_service(&mut self, name: &str) -> i32 {
        self.reopen_logger();
        if let Err(e) = self.detach_listeners_from_master() {
            error!("service {name} could not detach listeners: {e}");
        }
        self.resign(&format!("service[{name}]"));
        self.shutdown_application();

        let Some(service) = self.services.get(name) else {
            error!("unknown service {name}");
            return 1;
        };
        let argv = service.command();
        let Some((program, args)) = argv.split_first() else {
            error!("service {name} has an empty command");
            return 1;
        };
        info!("service {name} exec: {}", argv.join(" "));
        let err = Command::new(program)
            .args(args)
            .env_remove(fd_env_var())
            .env_remove(commit_matricide_env_var())
            .exec();
        error!("service {name} exec failed: {err}");
        1
    }

    /// Reopen the log sink so the child writes through its own descriptor.
    pub fn reopen_logger(&self) {
        if let Err(e) = self.sink.reopen() {
            warn!("could not reopen log sink: {e}");
        }
    }

    /// Mark every listener close-on-exec.
    pub fn detach_listeners_from_master(&mut self) -> MasterResult<()> {
        self.listeners.set_inheritable(false)?;
        Ok(())
    }

    /// Drop service client connections inherited from the master.
    pub fn reset_services(&mut self) {
        for service in self.services.values_mut() {
            service.reset();
        }
    }

    /// Give up the master role in a forked child and take the name `tag`.
    pub fn resign(&mut self, tag: &str) {
        self.handlers = None;
        self.pipe = None;
        self.signals.clear();
        self.forks.clear();
        self.callbacks.clear();
        // Dropped without unlinking; the path belongs to the master.
        self.control_port = None;
        if let Some(family) = self.family.as_mut() {
            family.resign();
        }
        self.set_proc_name(tag);
    }

    pub fn reset_application(&mut self, worker: &Worker) {
        for hook in &mut self.reset_app {
            hook(worker);
        }
    }

    pub fn shutdown_application(&mut self) {
        for hook in &mut self.shutdown_app {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::Idle;
    use crate::puppet::PuppetSpec;
    use marionette_common::config::PuppetSection;
    use std::cell::RefCell;
    use std::fs;
    use tempfile::TempDir;

    fn master() -> Master {
        Master::new(MasterSettings::default(), LogSink::stderr(), StartContext::capture().unwrap())
    }

    fn puppet(key: Option<&str>, count: usize) -> Puppet {
        let section = PuppetSection {
            key: key.map(str::to_string),
            count,
            ..Default::default()
        };
        Puppet::new(PuppetSpec::from(&section), Box::new(Idle))
    }

    fn service(name: &str) -> ServiceSection {
        ServiceSection {
            name: name.to_string(),
            command: vec!["sleep".into(), "60".into()],
            listen_host: "127.0.0.1".into(),
            listen_port: None,
            stop_signal: "TERM".into(),
            health_check: false,
            disabled: false,
        }
    }

    #[test]
    fn test_start_without_family_is_fatal() {
        let mut m = master();
        assert!(matches!(m.start(), Err(MasterError::NoFamily)));
    }

    #[test]
    fn test_start_without_main_puppet_is_fatal() {
        let mut m = master();
        let mut family = Family::new();
        family.add(puppet(Some("admin"), 1)).unwrap();
        m.set_family(family);
        assert!(matches!(m.start(), Err(MasterError::NoMainPuppet)));
    }

    #[test]
    fn test_duplicate_service_refused() {
        let mut m = master();
        m.use_service(&service("redis")).unwrap();
        assert!(matches!(
            m.use_service(&service("redis")),
            Err(MasterError::ServiceExists { .. })
        ));
        assert!(m.service("redis").is_some());
    }

    #[test]
    fn test_fork_queue_order_and_lookup() {
        let pid = getpid();
        let mut forks = ForkQueue::default();
        forks.push(ForkHandler::Worker {
            pool: None,
            worker: Worker::new(None, None, 0, pid).unwrap(),
        });
        forks.push(ForkHandler::Worker {
            pool: Some("admin".into()),
            worker: Worker::new(Some("admin"), None, 1, pid).unwrap(),
        });
        forks.unshift(ForkHandler::Service("redis".into()));

        assert_eq!(forks.len(), 3);
        assert!(forks.has_worker(None, 0));
        assert!(forks.has_worker(Some("admin"), 1));
        assert!(!forks.has_worker(Some("admin"), 0));
        assert!(forks.has_service("redis"));
        assert!(matches!(forks.pop(), Some(ForkHandler::Service(_))));

        forks.clear();
        assert!(forks.is_empty());
    }

    #[test]
    fn test_ttin_ttou_adjust_main_count() {
        let mut m = master();
        let mut family = Family::new();
        family.add(puppet(None, 1)).unwrap();
        m.set_family(family);

        m.dispatch(MasterSignal::Ttin).unwrap();
        m.dispatch(MasterSignal::Ttin).unwrap();
        assert_eq!(m.family().and_then(Family::main_puppet).unwrap().count(), 3);

        for _ in 0..5 {
            m.dispatch(MasterSignal::Ttou).unwrap();
        }
        assert_eq!(m.family().and_then(Family::main_puppet).unwrap().count(), 0);
    }

    #[test]
    fn test_hup_reenables_respawn() {
        let mut m = master();
        m.respawn = false;
        m.dispatch(MasterSignal::Hup).unwrap();
        assert!(m.respawn());
    }

    #[test]
    fn test_signal_queue_is_bounded() {
        let mut m = master();
        let pushed: Vec<bool> = [
            MasterSignal::Hup,
            MasterSignal::Ttin,
            MasterSignal::Ttou,
            MasterSignal::Winch,
            MasterSignal::Usr1,
            MasterSignal::Usr2,
            MasterSignal::Quit,
        ]
        .into_iter()
        .map(|s| m.queue_signal(s))
        .collect();
        assert_eq!(pushed, [true, true, true, true, true, false, false]);
        assert_eq!(m.pending_signals(), 5);
    }

    #[test]
    fn test_application_hooks_run_in_order() {
        let mut m = master();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let a = Rc::clone(&seen);
        m.on_reset_application(move |w| a.borrow_mut().push(format!("reset {}", w.nr())));
        let b = Rc::clone(&seen);
        m.on_shutdown_application(move || b.borrow_mut().push("shutdown".to_string()));

        let worker = Worker::new(None, None, 4, getpid()).unwrap();
        m.reset_application(&worker);
        m.shutdown_application();
        assert_eq!(*seen.borrow(), ["reset 4", "shutdown"]);
    }

    /// Other tests may reap `pid` through `waitpid(-1)`; poll instead of `wait`.
    fn gone_within(pid: Pid, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if has_exited(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_winch_respects_daemon_state() {
        let mut m = master();
        m.set_family(Family::new());
        m.dispatch(MasterSignal::Winch).unwrap();
        assert_eq!(m.respawn(), !is_daemonized());
    }

    #[test]
    fn test_wait_for_children_with_unbounded_timeout() {
        let mut m = master();
        m.settings.timeout = Duration::MAX;
        let escalated = Cell::new(false);
        m.wait_for_children(|_| true, |_| escalated.set(true));
        assert!(!escalated.get());
    }

    #[test]
    fn test_matricide_signals_then_takes_pid_file() {
        let dir = TempDir::new().unwrap();
        let configured = dir.path().join("m.pid");
        let predecessor = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(predecessor.id() as i32);
        fs::write(&configured, pid.to_string()).unwrap();

        let mut m = master();
        let own = PidFile::new(PidFile::new(&configured).reexec_path());
        own.write().unwrap();
        m.pid_file = Some(own);
        m.plan_matricide();

        let started = Instant::now();
        m.callbacks.fire(Hook::AllWorkersCheckedIn, HookEvent::CheckedIn);
        assert!(started.elapsed() < Duration::from_secs(1), "the loop step must not wait");
        assert!(m.matricide.get().is_some());

        assert!(gone_within(pid, Duration::from_secs(5)), "QUIT never reached {pid}");
        m.watch_predecessor();
        assert_eq!(m.pid_file(), Some(configured.as_path()));
        assert_eq!(PidFile::new(&configured).read(), Some(getpid()));
        assert!(m.matricide.get().is_none());
    }

    #[test]
    fn test_stubborn_predecessor_gets_kill_once() {
        let dir = TempDir::new().unwrap();
        let configured = dir.path().join("m.pid");
        let predecessor = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(predecessor.id() as i32);

        let mut m = master();
        let own = PidFile::new(PidFile::new(&configured).reexec_path());
        own.write().unwrap();
        m.pid_file = Some(own.clone());

        let Some(since) = Instant::now().checked_sub(Duration::from_secs(MATRICIDE_TIMEOUT_SECS + 1)) else {
            send_signal(pid, Signal::SIGKILL).unwrap();
            return;
        };
        m.matricide.set(Some(Matricide {
            pid: Some(pid),
            since,
            killed: false,
        }));
        m.watch_predecessor();
        assert!(m.matricide.get().is_some_and(|p| p.killed));
        assert_eq!(m.pid_file(), Some(own.path()));

        assert!(gone_within(pid, Duration::from_secs(5)), "KILL never reached {pid}");
        m.watch_predecessor();
        assert!(m.matricide.get().is_none());
        assert_eq!(m.pid_file(), Some(configured.as_path()));
    }

    #[test]
    fn test_stats_report_without_workers() {
        let m = master();
        let report = m.stats_report();
        assert!(report.starts_with(&format!("master {} up 00:00:", getpid())));
        assert!(report.ends_with("workers \n"));
    }
}
