//! Prelude module for common re-exports.
//!
//! ```rust
//! use marionette_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, LogLevel, MasterConfig, PuppetKind, PuppetSection, ServiceSection,
};
pub use crate::configurator::{Configurator, Placement};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{DEFAULT_LISTENER_KEY, DEFAULT_TIMEOUT_SECS, SIGNAL_QUEUE_CAPACITY};
