//! Single-threaded reactor for event-driven puppets.
//!
//! Tasks are closures over a caller-owned context `C`. The reactor offers
//! delayed, periodic and next-tick scheduling, cancellation, and readiness
//! watches on raw descriptors. Its only suspension point is `poll(2)` on the
//! watched descriptors, bounded by the nearest timer.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

/// Handle returned by every scheduling call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

type Task<C> = Box<dyn FnMut(&mut Reactor<C>, &mut C)>;

enum Schedule {
    Once,
    Every(Duration),
    Tick,
    Readable(RawFd),
}

struct Entry<C> {
    task: Task<C>,
    schedule: Schedule,
}

pub struct Reactor<C> {
    next_id: u64,
    entries: HashMap<TaskId, Entry<C>>,
    timers: BTreeMap<(Instant, TaskId), ()>,
    ticks: VecDeque<TaskId>,
    watches: BTreeMap<RawFd, TaskId>,
    running: bool,
    in_flight: Option<TaskId>,
    in_flight_cancelled: bool,
}

impl<C> Default for Reactor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Reactor<C> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            timers: BTreeMap::new(),
            ticks: VecDeque::new(),
            watches: BTreeMap::new(),
            running: false,
            in_flight: None,
            in_flight_cancelled: false,
        }
    }

    fn insert(&mut self, schedule: Schedule, task: Task<C>) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.entries.insert(id, Entry { task, schedule });
        id
    }

    /// Run `task` once after `delay`.
    pub fn schedule_after(&mut self, delay: Duration, task: impl FnMut(&mut Reactor<C>, &mut C) + 'static) -> TaskId {
        let id = self.insert(Schedule::Once, Box::new(task));
        self.timers.insert((Instant::now() + delay, id), ());
        id
    }

    /// Run `task` every `interval`, first after one interval.
    pub fn schedule_every(&mut self, interval: Duration, task: impl FnMut(&mut Reactor<C>, &mut C) + 'static) -> TaskId {
        let id = self.insert(Schedule::Every(interval), Box::new(task));
        self.timers.insert((Instant::now() + interval, id), ());
        id
    }

    /// Run `task` on the next turn, before timers and I/O.
    pub fn next_tick(&mut self, task: impl FnMut(&mut Reactor<C>, &mut C) + 'static) -> TaskId {
        let id = self.insert(Schedule::Tick, Box::new(task));
        self.ticks.push_back(id);
        id
    }

    /// Run `task` whenever `fd` is readable. Replaces an existing watch on `fd`.
    pub fn watch_readable(&mut self, fd: RawFd, task: impl FnMut(&mut Reactor<C>, &mut C) + 'static) -> TaskId {
        if let Some(old) = self.watches.get(&fd).copied() {
            self.cancel(old);
        }
        let id = self.insert(Schedule::Readable(fd), Box::new(task));
        self.watches.insert(fd, id);
        id
    }

    /// Cancel a task. Returns `false` if it already ran or never existed.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if self.in_flight == Some(id) {
            self.in_flight_cancelled = true;
            return true;
        }
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        match entry.schedule {
            Schedule::Once | Schedule::Every(_) => self.timers.retain(|(_, t), _| *t != id),
            Schedule::Tick => self.ticks.retain(|t| *t != id),
            Schedule::Readable(fd) => {
                self.watches.remove(&fd);
            }
        }
        true
    }

    /// Make [`Self::run`] return after the current task.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of live tasks.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Run until stopped or until nothing is left to do.
    pub fn run(&mut self, ctx: &mut C) -> io::Result<()> {
        self.running = true;
        while self.running && !self.entries.is_empty() {
            self.turn(ctx)?;
        }
        self.running = false;
        Ok(())
    }

    fn turn(&mut self, ctx: &mut C) -> io::Result<()> {
        let ticks: Vec<TaskId> = self.ticks.drain(..).collect();
        for id in ticks {
            self.dispatch(id, ctx);
            if !self.running {
                return Ok(());
            }
        }

        let now = Instant::now();
        let due: Vec<(Instant, TaskId)> = self.timers.range(..=(now, TaskId(u64::MAX))).map(|(k, _)| *k).collect();
        for key in due {
            self.timers.remove(&key);
            self.dispatch(key.1, ctx);
            if !self.running {
                return Ok(());
            }
        }

        if !self.ticks.is_empty() {
            return Ok(());
        }
        let timeout = self
            .timers
            .keys()
            .next()
            .map(|(at, _)| at.saturating_duration_since(Instant::now()));
        if self.watches.is_empty() {
            if let Some(wait) = timeout {
                std::thread::sleep(wait);
            }
            return Ok(());
        }

        for fd in self.wait_readable(timeout)? {
            if let Some(id) = self.watches.get(&fd).copied() {
                self.dispatch(id, ctx);
                if !self.running {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
        let fds: Vec<RawFd> = self.watches.keys().copied().collect();
        // SAFETY: watched descriptors are owned by the context and stay open
        // while they are registered.
        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| unsafe { BorrowedFd::borrow_raw(*fd) }).collect();
        let mut pollfds: Vec<PollFd<'_>> = borrowed.iter().map(|fd| PollFd::new(*fd, PollFlags::POLLIN)).collect();

        let timeout = match timeout {
            Some(wait) => PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        };
        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(fds
            .iter()
            .zip(&pollfds)
            .filter(|(_, p)| p.revents().is_some_and(|r| r.intersects(ready)))
            .map(|(fd, _)| *fd)
            .collect())
    }

    fn dispatch(&mut self, id: TaskId, ctx: &mut C) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        self.in_flight = Some(id);
        self.in_flight_cancelled = false;
        (entry.task)(self, ctx);
        self.in_flight = None;

        if self.in_flight_cancelled {
            if let Schedule::Readable(fd) = entry.schedule {
                self.watches.remove(&fd);
            }
            return;
        }
        match entry.schedule {
            Schedule::Once | Schedule::Tick => {}
            Schedule::Every(interval) => {
                self.timers.insert((Instant::now() + interval, id), ());
                self.entries.insert(id, entry);
            }
            Schedule::Readable(_) => {
                self.entries.insert(id, entry);
            }
        }
    }
}
