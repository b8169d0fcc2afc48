//! Section-based configurator.
//!
//! A configurator maps a section name to an ordered list of callables.
//! Sections are defined up front and invoked by name; a section body may
//! call other sections, which is how an entry section such as `main`
//! dispatches to an environment section that in turn includes `common`.
//!
//! ```rust
//! use marionette_common::configurator::Configurator;
//!
//! let mut c: Configurator<Vec<&'static str>> = Configurator::new();
//! c.define("common", |_, log| { log.push("common"); Ok(()) });
//! c.define("main", |c, log| { log.push("main"); c.call("common", log) });
//!
//! let mut log = Vec::new();
//! c.call("main", &mut log).unwrap();
//! assert_eq!(log, ["main", "common"]);
//! ```

use crate::config::ConfigError;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;

/// Maximum nesting of section calls before the configurator gives up.
const MAX_CALL_DEPTH: usize = 32;

/// A registered section body.
pub type Section<A> = Rc<dyn Fn(&Configurator<A>, &mut A) -> Result<(), ConfigError>>;

/// Where a new body is placed among a section's existing bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Run after the bodies already registered.
    Push,
    /// Run before the bodies already registered.
    Unshift,
}

/// Ordered section registry.
pub struct Configurator<A> {
    sections: HashMap<String, Vec<Section<A>>>,
    depth: Cell<usize>,
}

impl<A> Default for Configurator<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Configurator<A> {
    /// Create an empty configurator.
    pub fn new() -> Self {
        Self {
            sections: HashMap::new(),
            depth: Cell::new(0),
        }
    }

    /// Append a body to `name`, creating the section if needed.
    pub fn define<F>(&mut self, name: &str, body: F) -> &mut Self
    where
        F: Fn(&Configurator<A>, &mut A) -> Result<(), ConfigError> + 'static,
    {
        self.define_with(name, Placement::Push, body)
    }

    /// Register a body at the given placement.
    pub fn define_with<F>(&mut self, name: &str, placement: Placement, body: F) -> &mut Self
    where
        F: Fn(&Configurator<A>, &mut A) -> Result<(), ConfigError> + 'static,
    {
        let bodies = self.sections.entry(name.to_string()).or_default();
        match placement {
            Placement::Push => bodies.push(Rc::new(body)),
            Placement::Unshift => bodies.insert(0, Rc::new(body)),
        }
        self
    }

    /// Whether a section named `name` exists.
    pub fn include(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// Run every body of `name` in order.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the section is not defined
    /// or calls nest deeper than the configurator allows; otherwise the
    /// first error returned by a body.
    pub fn call(&self, name: &str, args: &mut A) -> Result<(), ConfigError> {
        let bodies = self
            .sections
            .get(name)
            .ok_or_else(|| ConfigError::ValidationError(format!("Section {name} not defined.")))?;

        if self.depth.get() >= MAX_CALL_DEPTH {
            return Err(ConfigError::ValidationError(format!(
                "section {name} nested deeper than {MAX_CALL_DEPTH} calls"
            )));
        }

        debug!(section = name, bodies = bodies.len(), "calling configurator section");
        self.depth.set(self.depth.get() + 1);
        let result = bodies.iter().try_for_each(|body| body(self, args));
        self.depth.set(self.depth.get() - 1);
        result
    }
}
