//! System-wide constants for the marionette workspace.
//!
//! Single source of truth for supervisor defaults and protocol names.
//! Imported by both crates; no duplication permitted.

use static_assertions::const_assert;

/// Default worker staleness threshold and shutdown deadline, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 45;

/// Default master nap between loop iterations, in seconds.
pub const DEFAULT_MASTER_NAP_SECS: u64 = 3;

/// Default nap between two units of work inside a worker, in seconds.
pub const DEFAULT_WORKER_NAP_SECS: u64 = 1;

/// Default number of workers per puppet.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Capacity of the master's pending-signal queue.
pub const SIGNAL_QUEUE_CAPACITY: usize = 5;

/// Poll interval while waiting for children to die during shutdown, in milliseconds.
pub const KILL_STEP_MS: u64 = 200;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Port range searched when a service has no fixed port (start inclusive, end exclusive).
pub const SERVICE_PORT_RANGE: (u16, u16) = (44_000, 45_000);

/// Default host services bind to.
pub const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";

/// Prefix of the re-exec environment variables.
pub const ENV_PREFIX: &str = "MARIONETTE";

/// Listener key of the unnamed primary listener set.
pub const DEFAULT_LISTENER_KEY: &str = "default";

/// Suffix inserted before `.pid` for the pid file of a re-exec'd master.
pub const REEXEC_PID_SUFFIX: &str = ".reexec";

/// Seconds a re-exec'd master gives its predecessor to exit before KILL.
pub const MATRICIDE_TIMEOUT_SECS: u64 = 60;

const_assert!(SIGNAL_QUEUE_CAPACITY > 0);
const_assert!(KILL_STEP_MS > 0);
const_assert!(SERVICE_PORT_RANGE.0 < SERVICE_PORT_RANGE.1);

/// Name of the environment variable carrying inherited listener fds.
pub fn fd_env_var() -> String {
    format!("{ENV_PREFIX}_FD")
}

/// Name of the environment variable requesting predecessor matricide.
pub fn commit_matricide_env_var() -> String {
    format!("{ENV_PREFIX}_COMMIT_MATRICIDE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_names_use_prefix() {
        assert_eq!(fd_env_var(), "MARIONETTE_FD");
        assert_eq!(commit_matricide_env_var(), "MARIONETTE_COMMIT_MATRICIDE");
    }

    #[test]
    fn defaults_are_consistent() {
        assert!(DEFAULT_TIMEOUT_SECS > DEFAULT_MASTER_NAP_SECS);
        assert!(DEFAULT_BACKLOG > 0);
    }
}
