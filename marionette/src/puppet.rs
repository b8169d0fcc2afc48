//! Worker pools.
//!
//! A [`Puppet`] declares how many workers a pool wants and what they run,
//! and keeps the map of live workers by pid. The master drives it:
//! `maintain_workers` converges the map toward `count`, `reap` removes the
//! dead, `murder_lazy_workers` kills the hung.

use crate::error::MasterResult;
use crate::master::{ForkHandler, ForkQueue};
use crate::payloads::{Payload, payload_by_name};
use crate::process_utils::send_signal;
use crate::reactor::Reactor;
use crate::socket::Listener;
use crate::worker::Worker;
use marionette_common::config::{PuppetKind, PuppetSection};
use marionette_common::consts::{DEFAULT_LISTENER_KEY, DEFAULT_WORKER_NAP_SECS};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{Pid, getpid};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{error, info, warn};

/// Slice used while napping so QUIT is noticed quickly.
const NAP_SLICE: Duration = Duration::from_millis(100);

/// Hook run around fork with the pool and the worker being forked.
pub type ForkHook = Box<dyn FnMut(&PuppetSpec, &Worker)>;

/// Static description of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PuppetSpec {
    key: Option<String>,
    /// Desired number of workers.
    pub count: usize,
    nap_time: Duration,
    proc_tag: Option<String>,
    kind: PuppetKind,
    listen: Option<String>,
}

impl PuppetSpec {
    /// Pool key; `None` for the main puppet.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Pool key for logs.
    pub fn display_key(&self) -> &str {
        self.key.as_deref().unwrap_or(DEFAULT_LISTENER_KEY)
    }

    pub fn nap_time(&self) -> Duration {
        self.nap_time
    }

    pub fn proc_tag(&self) -> Option<&str> {
        self.proc_tag.as_deref()
    }

    pub fn kind(&self) -> PuppetKind {
        self.kind
    }

    /// Listener key served by the payload, if any.
    pub fn listen(&self) -> Option<&str> {
        self.listen.as_deref()
    }
}

impl From<&PuppetSection> for PuppetSpec {
    fn from(section: &PuppetSection) -> Self {
        Self {
            key: section.pool_key().map(str::to_string),
            count: section.count,
            nap_time: Duration::try_from_secs_f64(section.nap_time)
                .unwrap_or(Duration::from_secs(DEFAULT_WORKER_NAP_SECS)),
            proc_tag: section.proc_tag.clone(),
            kind: section.kind,
            listen: section.listen.clone(),
        }
    }
}

/// A pool of identically configured workers.
pub struct Puppet {
    spec: PuppetSpec,
    payload: Box<dyn Payload>,
    workers: BTreeMap<Pid, Worker>,
    before_fork: Option<ForkHook>,
    after_fork: Option<ForkHook>,
    master_pid: Option<Pid>,
}

impl std::fmt::Debug for Puppet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puppet")
            .field("spec", &self.spec)
            .field("payload", &self.payload.name())
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Puppet {
    pub fn new(spec: PuppetSpec, payload: Box<dyn Payload>) -> Self {
        Self {
            spec,
            payload,
            workers: BTreeMap::new(),
            before_fork: None,
            after_fork: None,
            master_pid: None,
        }
    }

    /// Build from a `[[puppet]]` entry, resolving its payload by name.
    pub fn from_section(section: &PuppetSection) -> MasterResult<Self> {
        Ok(Self::new(PuppetSpec::from(section), payload_by_name(&section.payload)?))
    }

    /// Run `hook` in the master right before each fork.
    pub fn with_before_fork(mut self, hook: impl FnMut(&PuppetSpec, &Worker) + 'static) -> Self {
        self.before_fork = Some(Box::new(hook));
        self
    }

    /// Run `hook` in each child during init.
    pub fn with_after_fork(mut self, hook: impl FnMut(&PuppetSpec, &Worker) + 'static) -> Self {
        self.after_fork = Some(Box::new(hook));
        self
    }

    pub fn spec(&self) -> &PuppetSpec {
        &self.spec
    }

    pub fn key(&self) -> Option<&str> {
        self.spec.key()
    }

    pub fn count(&self) -> usize {
        self.spec.count
    }

    pub fn set_count(&mut self, count: usize) {
        self.spec.count = count;
    }

    pub fn workers(&self) -> &BTreeMap<Pid, Worker> {
        &self.workers
    }

    /// Attach to the master that will fork this pool's workers.
    pub fn build(&mut self, master_pid: Pid) {
        self.master_pid = Some(master_pid);
    }

    /// Record a freshly forked worker. Parent side of a fork.
    pub fn adopt(&mut self, pid: Pid, worker: Worker) {
        self.workers.insert(pid, worker);
    }

    /// Kill workers whose heartbeat went stale.
    ///
    /// A heartbeat that cannot be stat'd means the worker is gone: it gets
    /// QUIT and leaves the map. A heartbeat older than `timeout` gets KILL,
    /// no grace period.
    pub fn murder_lazy_workers(&mut self, timeout: Duration) {
        let now = SystemTime::now();
        let pids: Vec<Pid> = self.workers.keys().copied().collect();
        for pid in pids {
            let Some(worker) = self.workers.get(&pid) else {
                continue;
            };
            let last = match worker.heartbeat().last_change() {
                Ok(t) => t,
                Err(e) => {
                    warn!("worker={} PID:{pid} stat error: {e}", worker.nr());
                    self.kill_worker(Signal::SIGQUIT, pid);
                    self.workers.remove(&pid);
                    continue;
                }
            };

            let idle = now.duration_since(last).unwrap_or_default();
            if idle <= timeout {
                continue;
            }
            error!(
                "worker={} PID:{pid} timeout ({:.1}s > {}s), killing",
                worker.nr(),
                idle.as_secs_f64(),
                timeout.as_secs()
            );
            self.kill_worker(Signal::SIGKILL, pid);
        }
    }

    /// Full count and every worker's heartbeat advanced since spawn.
    pub fn all_workers_checked_in(&self) -> bool {
        self.workers.len() == self.spec.count && self.workers.values().all(Worker::checked_in)
    }

    pub fn kill_each_workers(&mut self, signal: Signal) {
        let pids: Vec<Pid> = self.workers.keys().copied().collect();
        for pid in pids {
            self.kill_worker(signal, pid);
        }
    }

    /// Move the worker map toward `count`: queue forks for missing ordinals,
    /// QUIT workers whose ordinal is at or above `count`.
    pub fn maintain_workers(&mut self, forks: &mut ForkQueue) -> MasterResult<()> {
        let count = self.spec.count;
        match self.workers.len().cmp(&count) {
            Ordering::Equal => Ok(()),
            Ordering::Less => self.spawn_missing_workers(forks),
            Ordering::Greater => {
                let excess: Vec<Pid> = self
                    .workers
                    .iter()
                    .filter(|(_, w)| w.nr() >= count)
                    .map(|(pid, _)| *pid)
                    .collect();
                for pid in excess {
                    self.kill_worker(Signal::SIGQUIT, pid);
                }
                Ok(())
            }
        }
    }

    /// Queue a fork for every ordinal in `0..count` without a live or pending worker.
    pub fn spawn_missing_workers(&mut self, forks: &mut ForkQueue) -> MasterResult<()> {
        let master_pid = self.master_pid.unwrap_or_else(getpid);
        for nr in 0..self.spec.count {
            if self.workers.values().any(|w| w.nr() == nr) || forks.has_worker(self.key(), nr) {
                continue;
            }
            let worker = Worker::new(self.key(), self.spec.proc_tag(), nr, master_pid)?;
            forks.push(ForkHandler::Worker {
                pool: self.spec.key.clone(),
                worker,
            });
        }
        Ok(())
    }

    /// Forget every worker. Runs in a freshly forked child.
    pub fn resign(&mut self) {
        self.workers.clear();
    }

    pub fn before_fork(&mut self, worker: &Worker) {
        if let Some(hook) = self.before_fork.as_mut() {
            hook(&self.spec, worker);
        }
    }

    pub fn after_fork(&mut self, worker: &Worker) {
        if let Some(hook) = self.after_fork.as_mut() {
            hook(&self.spec, worker);
        }
        release_heap();
    }

    /// Forget `pid` if it is ours. Returns whether it was.
    pub fn reap(&mut self, pid: Pid, status: &WaitStatus) -> bool {
        match self.workers.remove(&pid) {
            Some(worker) => {
                warn!("reaped {status:?} worker={}", worker.proc_tag());
                true
            }
            None => false,
        }
    }

    /// Signal a worker; a vanished process is dropped from the map.
    pub fn kill_worker(&mut self, signal: Signal, pid: Pid) {
        match send_signal(pid, signal) {
            Ok(true) => {}
            Ok(false) => {
                self.workers.remove(&pid);
            }
            Err(e) => error!("failed to send {signal} to worker PID:{pid}: {e}"),
        }
    }

    /// Run the payload until the worker is told to stop or orphaned.
    /// Runs in the child, with the worker's signal traps already in place;
    /// never returns an error.
    pub fn work_loop(&mut self, worker: Worker, listeners: Vec<Listener>) {
        warn!("worker {} started: {}", worker.proc_tag(), getpid());

        if let Err(e) = self.payload.setup(&self.spec, listeners) {
            error!("worker {} setup failed: {e}", worker.proc_tag());
            return;
        }

        match self.spec.kind {
            PuppetKind::Loop => self.loop_work(&worker),
            PuppetKind::Event => self.event_work(&worker),
        }
        self.payload.stop();

        warn!("worker {} stopped: {}", worker.proc_tag(), getpid());
    }

    fn loop_work(&mut self, worker: &Worker) {
        let Puppet { spec, payload, .. } = self;
        while worker.ok() {
            worker.alive();

            let outcome = catch_unwind(AssertUnwindSafe(|| payload.work(spec, worker)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("worker {} payload error: {e}", worker.proc_tag()),
                Err(panic) => {
                    error!("worker {} payload panicked: {}", worker.proc_tag(), panic_message(&panic));
                    break;
                }
            }

            if !worker.ok() {
                break;
            }
            worker.alive();
            nap(spec.nap_time, worker);
        }
    }

    fn event_work(&mut self, worker: &Worker) {
        let mut ctx = EventCtx {
            spec: &self.spec,
            payload: &mut self.payload,
            worker,
        };
        let mut reactor: Reactor<EventCtx<'_>> = Reactor::new();

        for fd in ctx.payload.watched_fds() {
            reactor.watch_readable(fd, move |r, ctx| {
                if let Err(e) = ctx.payload.readable(fd, ctx.spec, ctx.worker) {
                    error!("worker {} payload error: {e}", ctx.worker.proc_tag());
                }
                if !ctx.worker.ok() {
                    r.stop();
                }
            });
        }
        reactor.next_tick(|_, ctx| ctx.worker.alive());
        reactor.schedule_every(ctx.spec.nap_time, |r, ctx| {
            if ctx.worker.ok() {
                ctx.worker.alive();
            } else {
                info!("worker {} leaving reactor", ctx.worker.proc_tag());
                r.stop();
            }
        });

        match catch_unwind(AssertUnwindSafe(|| reactor.run(&mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("worker {} reactor error: {e}", worker.proc_tag()),
            Err(panic) => error!("worker {} payload panicked: {}", worker.proc_tag(), panic_message(&panic)),
        }
    }
}

struct EventCtx<'a> {
    spec: &'a PuppetSpec,
    payload: &'a mut Box<dyn Payload>,
    worker: &'a Worker,
}

fn nap(duration: Duration, worker: &Worker) {
    let deadline = Instant::now().checked_add(duration);
    while worker.ok() {
        let left = deadline.map_or(NAP_SLICE, |d| d.saturating_duration_since(Instant::now()));
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(NAP_SLICE));
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Hand freed heap pages back to the kernel after fork.
fn release_heap() {
    // SAFETY: malloc_trim only releases free memory held by the allocator.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    let _ = unsafe { libc::malloc_trim(0) };
}
