//! The module contract: what every BasePlate module presents to the host.
//!
//! A module declares itself through a [`ModuleDescriptor`] (name, version,
//! dependencies) returned by its [`ModuleFactory`], and implements
//! [`Module`] for lifecycle and health. The loader wraps each instance in a
//! [`ModuleHandle`], which owns the `running` flag and enforces the
//! lifecycle invariants: start at most once while stopped, idempotent stop,
//! and serialised access between lifecycle hooks and health probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::warn;

use baseplate_bus::MessageBus;
use baseplate_types::{HealthReport, PlateError};

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Declarative identity of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Unique identifier, non-empty.
    pub name: String,
    /// Semantic version string, informational.
    pub version: String,
    /// Names of modules that must start before this one, in declaration
    /// order.
    pub dependencies: Vec<String>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

impl std::fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module + factory traits
// ─────────────────────────────────────────────────────────────────────────────

/// A loaded module instance.
///
/// Lifecycle state lives in the [`ModuleHandle`], not the module: `start`
/// is only invoked on a stopped module, `stop` only on a running one, and
/// the handle tracks `running` from their outcomes.
pub trait Module: Send {
    /// Enter operation. Side effects only; the handle flips `running` on
    /// success.
    fn start(&mut self) -> Result<(), PlateError>;

    /// Cease operation. Failures are soft: the handle logs them and marks
    /// the module stopped regardless.
    fn stop(&mut self) -> Result<(), PlateError>;

    /// Health probe. `running` is the handle's current lifecycle state.
    ///
    /// The default report is `{healthy: running, status: "running"|"stopped"}`.
    /// Overrides may return any JSON object with at least a boolean
    /// `healthy` and a string `status`; malformed reports are replaced by
    /// the aggregator. Must not block beyond a few hundred milliseconds;
    /// the aggregator enforces a hard deadline regardless.
    fn system_check(&mut self, running: bool) -> Value {
        HealthReport::from_running(running).into_value()
    }
}

/// Produces module instances for the registry.
pub trait ModuleFactory: Send + Sync {
    /// The module's declarative identity. Must be stable across calls.
    fn descriptor(&self) -> ModuleDescriptor;

    /// Construct the module, bound to the bus and its configuration slice
    /// (`modules.<name>`, or an empty object when absent).
    fn build(
        &self,
        bus: Arc<MessageBus>,
        config: Value,
    ) -> Result<Box<dyn Module>, PlateError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// ModuleHandle
// ─────────────────────────────────────────────────────────────────────────────

/// A constructed module plus its lifecycle state.
///
/// The handle serialises lifecycle hooks and health probes through one
/// per-module mutex, so a probe issued while `start()` is in progress
/// simply waits (and is clamped by the aggregator deadline).
pub struct ModuleHandle {
    descriptor: ModuleDescriptor,
    running: AtomicBool,
    module: Mutex<Box<dyn Module>>,
}

impl ModuleHandle {
    pub fn new(descriptor: ModuleDescriptor, module: Box<dyn Module>) -> Self {
        Self {
            descriptor,
            running: AtomicBool::new(false),
            module: Mutex::new(module),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the module. No-op (with a warning) when already running, so
    /// `start` is invoked at most once before a matching `stop`.
    pub fn start(&self) -> Result<(), PlateError> {
        if self.is_running() {
            warn!(module = self.name(), "start called on running module; ignoring");
            return Ok(());
        }
        let mut module = self.lock_module();
        module.start().map_err(|e| PlateError::ModuleStart {
            module: self.descriptor.name.clone(),
            cause: e.to_string(),
        })?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the module. Idempotent: only the call that observes
    /// `running == true` reaches the module, and the module is marked
    /// stopped whether or not its cleanup succeeded.
    pub fn stop(&self) -> Result<(), PlateError> {
        if self.running.swap(false, Ordering::SeqCst) {
            let mut module = self.lock_module();
            module.stop().map_err(|e| PlateError::ModuleStop {
                module: self.descriptor.name.clone(),
                cause: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Run the module's health probe under the module lock.
    pub fn system_check(&self) -> Value {
        let running = self.is_running();
        let mut module = self.lock_module();
        module.system_check(running)
    }

    // A probe that panicked may have poisoned the lock; the module owns its
    // own consistency, so recover the guard and carry on.
    fn lock_module(&self) -> MutexGuard<'_, Box<dyn Module>> {
        self.module
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("descriptor", &self.descriptor)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingModule {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl Module for CountingModule {
        fn start(&mut self) -> Result<(), PlateError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(PlateError::Config("synthetic start failure".to_string()));
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PlateError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_handle(fail_start: bool) -> (ModuleHandle, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let handle = ModuleHandle::new(
            ModuleDescriptor::new("counting", "1.0.0"),
            Box::new(CountingModule {
                starts: starts.clone(),
                stops: stops.clone(),
                fail_start,
            }),
        );
        (handle, starts, stops)
    }

    #[test]
    fn start_sets_running_and_stop_clears_it() {
        let (handle, _, _) = counting_handle(false);
        assert!(!handle.is_running());

        handle.start().unwrap();
        assert!(handle.is_running());

        handle.stop().unwrap();
        assert!(!handle.is_running());
    }

    #[test]
    fn failed_start_leaves_module_stopped() {
        let (handle, _, _) = counting_handle(true);
        let err = handle.start().unwrap_err();
        assert!(matches!(err, PlateError::ModuleStart { ref module, .. } if module == "counting"));
        assert!(!handle.is_running());
    }

    #[test]
    fn double_start_reaches_module_once() {
        let (handle, starts, _) = counting_handle(false);
        handle.start().unwrap();
        handle.start().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_stop_reaches_module_once() {
        let (handle, _, stops) = counting_handle(false);
        handle.start().unwrap();
        handle.stop().unwrap();
        handle.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_start_is_noop() {
        let (handle, _, stops) = counting_handle(false);
        handle.stop().unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_system_check_tracks_running_flag() {
        let (handle, _, _) = counting_handle(false);
        let report = handle.system_check();
        assert_eq!(report["healthy"], json!(false));
        assert_eq!(report["status"], json!("stopped"));

        handle.start().unwrap();
        let report = handle.system_check();
        assert_eq!(report["healthy"], json!(true));
        assert_eq!(report["status"], json!("running"));
    }

    #[test]
    fn restart_after_stop_is_permitted() {
        let (handle, starts, stops) = counting_handle(false);
        handle.start().unwrap();
        handle.stop().unwrap();
        handle.start().unwrap();
        assert!(handle.is_running());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn descriptor_display_is_name_at_version() {
        let desc = ModuleDescriptor::new("comms", "2.0.0").with_dependencies(&["data_store"]);
        assert_eq!(desc.to_string(), "comms@2.0.0");
        assert_eq!(desc.dependencies, vec!["data_store".to_string()]);
    }
}
