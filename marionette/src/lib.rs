//! # Marionette
//!
//! Pre-fork master/worker process supervisor.
//!
//! A single-threaded master forks pools of workers ("puppets"), watches
//! their heartbeats, restarts the dead, supervises auxiliary services and
//! hands its listening sockets to a re-exec'd copy of itself for
//! zero-downtime upgrades.
//!
//! # Module Structure
//!
//! - [`master`] - Event loop, signal dispatch, shutdown, re-exec
//! - [`family`] - The set of puppets under one master
//! - [`puppet`] - Worker pools and their work loops
//! - [`worker`] - Per-process liveness handle and heartbeat
//! - [`service`] - Auxiliary single-instance processes
//! - [`socket`] - Listener specs, creation and fd inheritance
//! - [`signals`] - Signal queue, self-pipe, handler installation
//! - [`reactor`] - Single-threaded task scheduler for event puppets
//! - [`payloads`] - The `Payload` trait and built-in payloads
//! - [`control_port`] - Unix-socket `!stats` channel
//! - [`callbacks`] - Master hooks (`ReapDeadChildren`, `AllWorkersCheckedIn`)
//! - [`process_utils`] - Pid files, liveness, descriptor flags
//! - [`logging`] - Reopenable log sink and tracing setup
//! - [`runtime`] - Process-wide context
//! - [`error`] - `MasterError`
//!
//! # Architecture
//!
//! ```text
//!  signals ──► self-pipe ──► ┌──────────────┐ ──fork──► worker (Puppet::work_loop)
//!  SIGCHLD ──► self-pipe ──► │    Master    │ ──fork──► service (exec)
//!  control port ───────────► │  (one loop)  │ ──fork+exec──► successor master
//!                            └──────┬───────┘              (MARIONETTE_FD)
//!                                   │ owns
//!                     Family ── Puppets ── Workers (heartbeats)
//! ```

pub mod callbacks;
pub mod control_port;
pub mod error;
pub mod family;
pub mod logging;
pub mod master;
pub mod payloads;
pub mod process_utils;
pub mod puppet;
pub mod reactor;
pub mod runtime;
pub mod service;
pub mod signals;
pub mod socket;
pub mod worker;

pub use crate::error::{MasterError, MasterResult};
pub use crate::family::Family;
pub use crate::master::{Master, MasterSettings, StopMode};
pub use crate::puppet::{Puppet, PuppetSpec};
pub use crate::runtime::{Runtime, StartContext};
