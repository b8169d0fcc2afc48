//! Error types for supervisor operations

use marionette_common::config::ConfigError;
use thiserror::Error;

/// Errors that can occur while building or running the master
#[derive(Error, Debug)]
pub enum MasterError {
    /// `start()` called without a family
    #[error("Please specify the family of puppets to run")]
    NoFamily,

    /// Family has no puppet under the default key
    #[error("Must specify a main puppet to run")]
    NoMainPuppet,

    /// A puppet with this key is already part of the family
    #[error("Puppet {key} already exists")]
    PuppetExists {
        /// Pool key
        key: String,
    },

    /// Listener set initialized twice
    #[error("Listener set {key} already initialized")]
    ListenerExists {
        /// Listener key
        key: String,
    },

    /// Listener spec is neither `host:port`, a bare port, nor an absolute path
    #[error("Invalid listener spec: {spec}")]
    InvalidListenerSpec {
        /// Offending spec
        spec: String,
    },

    /// Listener path exists but is not a socket
    #[error("socket={path} specified but it is not a socket!")]
    NotASocket {
        /// Filesystem path
        path: String,
    },

    /// Inherited fd environment entry could not be decoded
    #[error("Invalid inherited listener entry: {entry}")]
    InheritedFd {
        /// Raw `key|fd` entry
        entry: String,
    },

    /// Service name registered twice
    #[error("Service {name} already exist!")]
    ServiceExists {
        /// Service name
        name: String,
    },

    /// No free port left in the service port range
    #[error("No available port in {start}..{end}")]
    NoAvailablePort {
        /// Range start (inclusive)
        start: u16,
        /// Range end (exclusive)
        end: u16,
    },

    /// Unknown signal name
    #[error("Unknown signal: {name}")]
    UnknownSignal {
        /// Name as configured
        name: String,
    },

    /// Unknown payload name
    #[error("Unknown payload: {name}")]
    UnknownPayload {
        /// Name as configured
        name: String,
    },

    /// A second runtime context was constructed in this process
    #[error("You can't run multiple masters in the same process!")]
    SecondRuntime,

    /// Configuration error
    #[error("Configuration error: {source}")]
    Config {
        /// Source config error
        #[from]
        source: ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

/// Result type for supervisor operations
pub type MasterResult<T> = Result<T, MasterError>;
