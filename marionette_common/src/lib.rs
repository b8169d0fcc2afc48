//! Marionette Common Library
//!
//! This crate provides shared constants, the TOML configuration model and
//! the section-based configurator used by the marionette supervisor.
//!
//! # Module Structure
//!
//! - [`consts`] - Supervisor defaults and protocol names
//! - [`config`] - Configuration loading traits and types
//! - [`configurator`] - Named sections of ordered callables
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use marionette_common::config::{ConfigLoader, MasterConfig};
//! use marionette_common::consts::DEFAULT_TIMEOUT_SECS;
//! ```

pub mod config;
pub mod configurator;
pub mod consts;
pub mod prelude;
