//! The set of puppets under one master.

use crate::error::{MasterError, MasterResult};
use crate::master::ForkQueue;
use crate::puppet::Puppet;
use crate::worker::Worker;
use marionette_common::consts::DEFAULT_LISTENER_KEY;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::time::Duration;

/// Puppets keyed by pool key; the main puppet sits under `default`.
#[derive(Debug, Default)]
pub struct Family {
    puppets: BTreeMap<String, Puppet>,
}

fn slot(key: Option<&str>) -> &str {
    key.unwrap_or(DEFAULT_LISTENER_KEY)
}

impl Family {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a puppet. At most one per key.
    pub fn add(&mut self, puppet: Puppet) -> MasterResult<()> {
        let key = slot(puppet.key()).to_string();
        if self.puppets.contains_key(&key) {
            return Err(MasterError::PuppetExists { key });
        }
        self.puppets.insert(key, puppet);
        Ok(())
    }

    pub fn main_puppet(&self) -> Option<&Puppet> {
        self.get(None)
    }

    pub fn main_puppet_mut(&mut self) -> Option<&mut Puppet> {
        self.get_mut(None)
    }

    pub fn get(&self, key: Option<&str>) -> Option<&Puppet> {
        self.puppets.get(slot(key))
    }

    pub fn get_mut(&mut self, key: Option<&str>) -> Option<&mut Puppet> {
        self.puppets.get_mut(slot(key))
    }

    /// Remove a puppet, handing it to the caller.
    pub fn take(&mut self, key: Option<&str>) -> Option<Puppet> {
        self.puppets.remove(slot(key))
    }

    pub fn puppets(&self) -> impl Iterator<Item = &Puppet> {
        self.puppets.values()
    }

    pub fn build(&mut self, master_pid: Pid) {
        for puppet in self.puppets.values_mut() {
            puppet.build(master_pid);
        }
    }

    pub fn murder_lazy_workers(&mut self, timeout: Duration) {
        for puppet in self.puppets.values_mut() {
            puppet.murder_lazy_workers(timeout);
        }
    }

    pub fn maintain_workers(&mut self, forks: &mut ForkQueue) -> MasterResult<()> {
        self.puppets
            .values_mut()
            .try_for_each(|puppet| puppet.maintain_workers(forks))
    }

    pub fn kill_each_workers(&mut self, signal: Signal) {
        for puppet in self.puppets.values_mut() {
            puppet.kill_each_workers(signal);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.puppets.values().map(|p| p.workers().len()).sum()
    }

    pub fn all_workers_dead(&self) -> bool {
        self.worker_count() == 0
    }

    /// Every live worker across all pools.
    pub fn workers(&self) -> impl Iterator<Item = (&Pid, &Worker)> {
        self.puppets.values().flat_map(|p| p.workers().iter())
    }

    pub fn resign(&mut self) {
        for puppet in self.puppets.values_mut() {
            puppet.resign();
        }
    }

    /// Offer a reaped pid to every puppet. Returns whether one owned it.
    pub fn reap(&mut self, pid: Pid, status: &WaitStatus) -> bool {
        self.puppets
            .values_mut()
            .fold(false, |owned, puppet| puppet.reap(pid, status) || owned)
    }

    /// Record a forked worker in its pool.
    pub fn adopt(&mut self, pool: Option<&str>, pid: Pid, worker: Worker) {
        if let Some(puppet) = self.get_mut(pool) {
            puppet.adopt(pid, worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payloads::Idle;
    use crate::puppet::PuppetSpec;
    use marionette_common::config::PuppetSection;
    use nix::unistd::getppid;

    fn puppet(key: Option<&str>, count: usize) -> Puppet {
        let section = PuppetSection {
            key: key.map(str::to_string),
            count,
            ..Default::default()
        };
        Puppet::new(PuppetSpec::from(&section), Box::new(Idle))
    }

    #[test]
    fn test_add_rejects_duplicate_key() {
        let mut family = Family::new();
        family.add(puppet(None, 1)).unwrap();
        family.add(puppet(Some("admin"), 1)).unwrap();
        assert!(matches!(
            family.add(puppet(Some("default"), 1)),
            Err(MasterError::PuppetExists { .. })
        ));
        assert!(family.main_puppet().is_some());
        assert!(family.get(Some("admin")).is_some());
    }

    #[test]
    fn test_maintain_fans_out_to_every_pool() {
        let mut family = Family::new();
        family.add(puppet(None, 2)).unwrap();
        family.add(puppet(Some("admin"), 1)).unwrap();
        family.build(getppid());

        let mut forks = ForkQueue::default();
        family.maintain_workers(&mut forks).unwrap();
        assert_eq!(forks.len(), 3);
        assert!(forks.has_worker(Some("admin"), 0));
        assert!(forks.has_worker(None, 1));
    }

    #[test]
    fn test_reap_and_counts() {
        let mut family = Family::new();
        family.add(puppet(None, 1)).unwrap();
        family.add(puppet(Some("admin"), 1)).unwrap();

        let (a, b) = (Pid::from_raw(900_001), Pid::from_raw(900_002));
        family.adopt(None, a, Worker::new(None, None, 0, getppid()).unwrap());
        family.adopt(Some("admin"), b, Worker::new(Some("admin"), None, 0, getppid()).unwrap());
        assert_eq!(family.worker_count(), 2);
        assert_eq!(family.workers().count(), 2);

        assert!(family.reap(b, &WaitStatus::Exited(b, 0)));
        assert!(!family.reap(b, &WaitStatus::Exited(b, 0)));
        assert_eq!(family.worker_count(), 1);

        family.resign();
        assert!(family.all_workers_dead());
    }
}
