//! [`PlateError`] – the global error type for the module host core.
//!
//! Boot-time variants (`Config` through `ModuleStart`) are fatal: the host
//! aborts with a non-zero exit. Steady-state variants (`Handler`,
//! `ModuleStop`) are contained and logged where they occur; they never
//! terminate the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the BasePlate core.
///
/// Causes are carried as strings so the enum stays serialisable across the
/// bus and into structured logs.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PlateError {
    /// Configuration file missing or malformed.
    #[error("Config error: {0}")]
    Config(String),

    /// Two candidates with the same name registered in the same layer.
    #[error("Duplicate module '{name}' in layer '{layer}'")]
    DuplicateModule { name: String, layer: String },

    /// A declared dependency is not among the enabled modules.
    #[error("Module '{module}' depends on '{dependency}' which is {reason}")]
    MissingDependency {
        module: String,
        dependency: String,
        /// "not found" or "disabled"
        reason: String,
    },

    /// A cycle in the dependency graph.
    #[error("Circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Module construction failed; nothing was started.
    #[error("Failed to load module '{module}': {cause}")]
    ModuleLoad { module: String, cause: String },

    /// A module's `start()` failed; previously started modules were stopped.
    #[error("Failed to start module '{module}': {cause}")]
    ModuleStart { module: String, cause: String },

    /// A module's `stop()` failed. Logged only; teardown continues.
    #[error("Error stopping module '{module}': {cause}")]
    ModuleStop { module: String, cause: String },

    /// A bus subscriber failed during delivery. Logged by the bus; other
    /// handlers still run.
    #[error("Handler error on topic '{topic}': {cause}")]
    Handler { topic: String, cause: String },
}

impl PlateError {
    /// The module name this error concerns, when there is one.
    pub fn module(&self) -> Option<&str> {
        match self {
            PlateError::DuplicateModule { name, .. } => Some(name),
            PlateError::MissingDependency { module, .. }
            | PlateError::ModuleLoad { module, .. }
            | PlateError::ModuleStart { module, .. }
            | PlateError::ModuleStop { module, .. } => Some(module),
            PlateError::CircularDependency { cycle } => cycle.first().map(String::as_str),
            PlateError::Config(_) | PlateError::Handler { .. } => None,
        }
    }
}
