//! `baseplate-kernel` – Module Host Core
//!
//! The machinery that turns a set of module factories into a running asset
//! OS: the module contract, the layered registry that stands in for
//! on-disk search roots, the loader that resolves dependencies and drives
//! lifecycle, and the system-check aggregator.
//!
//! # Modules
//!
//! - [`module`] – the [`Module`][module::Module] trait, the
//!   [`ModuleFactory`][module::ModuleFactory] that produces instances, the
//!   declarative [`ModuleDescriptor`][module::ModuleDescriptor], and the
//!   [`ModuleHandle`][module::ModuleHandle] that owns lifecycle state.
//! - [`registry`] – [`ModuleRegistry`][registry::ModuleRegistry]: ordered
//!   layers of factories with override and duplicate rules.
//! - [`loader`] – [`ModuleLoader`][loader::ModuleLoader]: discovery,
//!   dependency resolution, ordered start/stop, health aggregation.
//! - [`syscheck`] – the parallel health-probe aggregator with a shared
//!   deadline and per-module error containment.

pub mod loader;
pub mod module;
pub mod registry;
pub mod syscheck;

pub use loader::ModuleLoader;
pub use module::{Module, ModuleDescriptor, ModuleFactory, ModuleHandle};
pub use registry::{Candidate, ModuleRegistry, RegistryLayer};
