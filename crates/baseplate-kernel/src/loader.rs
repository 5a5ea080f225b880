//! [`ModuleLoader`] – discovery, dependency resolution, lifecycle.
//!
//! The loader turns the registry's candidate list into a running module
//! set: it filters disabled modules, orders the rest topologically by their
//! declared dependencies, constructs each with its bus handle and config
//! slice, and drives `start`/`stop` in dependency order. It also fronts the
//! system-check aggregator so health requests can be served from bus
//! handlers on arbitrary threads.
//!
//! Lifecycle methods are single-writer (the host thread); the module list
//! is readable concurrently once `start_all` has completed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info};

use baseplate_bus::MessageBus;
use baseplate_types::{AggregateHealth, Config, PlateError};

use crate::module::{ModuleDescriptor, ModuleHandle};
use crate::registry::{Candidate, ModuleRegistry};
use crate::syscheck;

#[derive(Default)]
struct LoaderState {
    candidates: Vec<Candidate>,
    load_order: Vec<String>,
    handles: Vec<Arc<ModuleHandle>>,
}

/// Discovers, orders, constructs, and runs the module set.
pub struct ModuleLoader {
    bus: Arc<MessageBus>,
    config: Config,
    registry: ModuleRegistry,
    state: RwLock<LoaderState>,
}

impl ModuleLoader {
    pub fn new(bus: Arc<MessageBus>, config: Config, registry: ModuleRegistry) -> Self {
        Self {
            bus,
            config,
            registry,
            state: RwLock::new(LoaderState::default()),
        }
    }

    /// Walk the registry layers and record the post-override candidate set.
    pub fn discover(&self) -> Result<Vec<ModuleDescriptor>, PlateError> {
        let candidates = self.registry.discover()?;
        let descriptors: Vec<ModuleDescriptor> =
            candidates.iter().map(|c| c.descriptor.clone()).collect();
        info!(
            count = descriptors.len(),
            modules = %descriptors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "discovered modules"
        );
        self.write_state().candidates = candidates;
        Ok(descriptors)
    }

    /// Filter disabled modules and compute the start order.
    ///
    /// Topological sort over declared dependencies; among modules of equal
    /// rank, discovery order is preserved.
    pub fn resolve(&self) -> Result<Vec<String>, PlateError> {
        let candidates: Vec<Candidate> = self.read_state().candidates.clone();

        let all_names: HashSet<&str> =
            candidates.iter().map(|c| c.descriptor.name.as_str()).collect();
        let enabled: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| {
                let on = self.config.module_enabled(&c.descriptor.name);
                if !on {
                    info!(module = %c.descriptor.name, "module disabled in config");
                }
                on
            })
            .collect();
        let enabled_names: HashSet<&str> =
            enabled.iter().map(|c| c.descriptor.name.as_str()).collect();

        for candidate in &enabled {
            for dep in &candidate.descriptor.dependencies {
                if !enabled_names.contains(dep.as_str()) {
                    let reason = if all_names.contains(dep.as_str()) {
                        "disabled"
                    } else {
                        "not found"
                    };
                    return Err(PlateError::MissingDependency {
                        module: candidate.descriptor.name.clone(),
                        dependency: dep.clone(),
                        reason: reason.to_string(),
                    });
                }
            }
        }

        let load_order = topo_sort(&enabled)?;
        info!(order = %load_order.join(" -> "), "module load order");
        self.write_state().load_order = load_order.clone();
        Ok(load_order)
    }

    /// Construct every module in resolved order with `(bus, config slice)`.
    ///
    /// A construction failure aborts loading; modules constructed so far are
    /// discarded unstarted.
    pub fn instantiate(&self) -> Result<(), PlateError> {
        let (candidates, load_order) = {
            let state = self.read_state();
            (state.candidates.clone(), state.load_order.clone())
        };
        let by_name: HashMap<&str, &Candidate> = candidates
            .iter()
            .map(|c| (c.descriptor.name.as_str(), c))
            .collect();

        let mut handles = Vec::with_capacity(load_order.len());
        for name in &load_order {
            let candidate = by_name.get(name.as_str()).ok_or_else(|| PlateError::ModuleLoad {
                module: name.clone(),
                cause: "module absent from discovery results; run discover() and resolve() first"
                    .to_string(),
            })?;
            let slice = self.config.module_slice(name);
            let module = candidate.factory.build(self.bus.clone(), slice).map_err(|e| {
                PlateError::ModuleLoad {
                    module: name.clone(),
                    cause: e.to_string(),
                }
            })?;
            info!(module = %candidate.descriptor, "loaded module");
            handles.push(Arc::new(ModuleHandle::new(candidate.descriptor.clone(), module)));
        }

        self.write_state().handles = handles;
        Ok(())
    }

    /// Start every constructed module in resolved order.
    ///
    /// On the first failure, modules started so far are stopped in reverse
    /// order and the start error is surfaced; partial success is not
    /// permitted.
    pub fn start_all(&self) -> Result<(), PlateError> {
        let handles = self.handles();
        for (idx, handle) in handles.iter().enumerate() {
            info!(module = handle.name(), "starting module");
            if let Err(e) = handle.start() {
                error!(module = handle.name(), error = %e, "module start failed; rolling back");
                for started in handles[..idx].iter().rev() {
                    info!(module = started.name(), "stopping module (rollback)");
                    if let Err(stop_err) = started.stop() {
                        error!(module = started.name(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop every running module in reverse start order.
    ///
    /// Stop failures are logged and never halt teardown; each started
    /// module receives exactly one stop.
    pub fn stop_all(&self) {
        for handle in self.handles().iter().rev() {
            if handle.is_running() {
                info!(module = handle.name(), "stopping module");
            }
            if let Err(e) = handle.stop() {
                error!(module = handle.name(), error = %e, "module stop failed");
            }
        }
    }

    /// Probe every loaded module's health in parallel under `timeout`.
    pub fn run_system_check(&self, timeout: Duration) -> AggregateHealth {
        syscheck::run(&self.handles(), timeout)
    }

    /// A loaded module's handle, by name.
    pub fn module(&self, name: &str) -> Option<Arc<ModuleHandle>> {
        self.handles().iter().find(|h| h.name() == name).cloned()
    }

    /// Loaded module names, in start order.
    pub fn module_names(&self) -> Vec<String> {
        self.handles().iter().map(|h| h.name().to_string()).collect()
    }

    fn handles(&self) -> Vec<Arc<ModuleHandle>> {
        self.read_state().handles.clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, LoaderState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, LoaderState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Kahn's algorithm with a FIFO frontier, so equal-rank modules keep their
/// discovery order.
fn topo_sort(enabled: &[&Candidate]) -> Result<Vec<String>, PlateError> {
    let names: Vec<&str> = enabled.iter().map(|c| c.descriptor.name.as_str()).collect();
    let deps_of: HashMap<&str, HashSet<&str>> = enabled
        .iter()
        .map(|c| {
            (
                c.descriptor.name.as_str(),
                c.descriptor.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut in_degree: HashMap<&str, usize> = names
        .iter()
        .map(|name| (*name, deps_of[name].len()))
        .collect();

    let mut frontier: VecDeque<&str> = names
        .iter()
        .filter(|name| in_degree[*name] == 0)
        .copied()
        .collect();
    let mut load_order: Vec<String> = Vec::with_capacity(names.len());

    while let Some(current) = frontier.pop_front() {
        load_order.push(current.to_string());
        for name in &names {
            if deps_of[name].contains(current) {
                if let Some(degree) = in_degree.get_mut(name) {
                    *degree -= 1;
                    if *degree == 0 {
                        frontier.push_back(*name);
                    }
                }
            }
        }
    }

    if load_order.len() != names.len() {
        let remaining: HashSet<&str> = names
            .iter()
            .filter(|name| !load_order.iter().any(|done| done == *name))
            .copied()
            .collect();
        return Err(PlateError::CircularDependency {
            cycle: extract_cycle(&names, &deps_of, &remaining),
        });
    }

    Ok(load_order)
}

/// Walk dependency edges inside the unresolved set until a node repeats;
/// the repeated suffix is a concrete cycle.
fn extract_cycle(
    names: &[&str],
    deps_of: &HashMap<&str, HashSet<&str>>,
    remaining: &HashSet<&str>,
) -> Vec<String> {
    let Some(start) = names.iter().find(|name| remaining.contains(*name)) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut seen_at: HashMap<&str, usize> = HashMap::new();
    let mut current = *start;
    loop {
        if let Some(&pos) = seen_at.get(current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        seen_at.insert(current, path.len());
        path.push(current);
        // Every unresolved node has at least one dependency that is itself
        // unresolved, so the walk always continues until it closes a loop.
        match deps_of[current].iter().find(|dep| remaining.contains(*dep)) {
            Some(next) => current = *next,
            None => {
                return path.iter().map(|s| s.to_string()).collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleFactory};
    use crate::registry::RegistryLayer;
    use serde_json::Value;
    use std::sync::Mutex;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct ScriptedModule {
        name: &'static str,
        log: EventLog,
        fail_start: bool,
        fail_stop: bool,
    }

    impl Module for ScriptedModule {
        fn start(&mut self) -> Result<(), PlateError> {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                return Err(PlateError::Config("scripted start failure".to_string()));
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PlateError> {
            self.log.lock().unwrap().push(format!("stop:{}", self.name));
            if self.fail_stop {
                return Err(PlateError::Config("scripted stop failure".to_string()));
            }
            Ok(())
        }
    }

    struct ScriptedFactory {
        name: &'static str,
        deps: Vec<&'static str>,
        log: EventLog,
        fail_start: bool,
        fail_stop: bool,
        fail_build: bool,
    }

    impl ScriptedFactory {
        fn new(name: &'static str, deps: &[&'static str], log: &EventLog) -> Self {
            Self {
                name,
                deps: deps.to_vec(),
                log: log.clone(),
                fail_start: false,
                fail_stop: false,
                fail_build: false,
            }
        }

        fn failing_start(mut self) -> Self {
            self.fail_start = true;
            self
        }

        fn failing_stop(mut self) -> Self {
            self.fail_stop = true;
            self
        }

        fn failing_build(mut self) -> Self {
            self.fail_build = true;
            self
        }
    }

    impl ModuleFactory for ScriptedFactory {
        fn descriptor(&self) -> ModuleDescriptor {
            ModuleDescriptor::new(self.name, "1.0.0").with_dependencies(&self.deps)
        }

        fn build(
            &self,
            _bus: Arc<MessageBus>,
            _config: Value,
        ) -> Result<Box<dyn Module>, PlateError> {
            if self.fail_build {
                return Err(PlateError::Config("scripted build failure".to_string()));
            }
            Ok(Box::new(ScriptedModule {
                name: self.name,
                log: self.log.clone(),
                fail_start: self.fail_start,
                fail_stop: self.fail_stop,
            }))
        }
    }

    fn loader_with(config: &str, factories: Vec<ScriptedFactory>) -> ModuleLoader {
        let mut layer = RegistryLayer::new("builtin");
        for factory in factories {
            layer = layer.register(factory);
        }
        ModuleLoader::new(
            Arc::new(MessageBus::new()),
            Config::from_str(config).unwrap(),
            ModuleRegistry::new().push_layer(layer),
        )
    }

    fn boot(loader: &ModuleLoader) -> Result<(), PlateError> {
        loader.discover()?;
        loader.resolve()?;
        loader.instantiate()?;
        loader.start_all()
    }

    #[test]
    fn start_order_follows_dependencies_and_stop_reverses() {
        let log: EventLog = Default::default();
        // Registered out of dependency order on purpose.
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("c", &["a", "b"], &log),
                ScriptedFactory::new("b", &["a"], &log),
                ScriptedFactory::new("a", &[], &log),
            ],
        );

        boot(&loader).unwrap();
        loader.stop_all();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "start:c", "stop:c", "stop:b", "stop:a"]
        );
    }

    #[test]
    fn equal_rank_modules_keep_discovery_order() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("zeta", &[], &log),
                ScriptedFactory::new("alpha", &[], &log),
                ScriptedFactory::new("mid", &[], &log),
            ],
        );

        loader.discover().unwrap();
        let order = loader.resolve().unwrap();
        assert_eq!(order, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn missing_dependency_is_fatal() {
        let log: EventLog = Default::default();
        let loader = loader_with("{}", vec![ScriptedFactory::new("ops", &["comms"], &log)]);

        loader.discover().unwrap();
        let err = loader.resolve().unwrap_err();
        assert!(matches!(
            err,
            PlateError::MissingDependency { ref module, ref dependency, ref reason }
                if module == "ops" && dependency == "comms" && reason == "not found"
        ));
    }

    #[test]
    fn dependency_on_disabled_module_names_the_reason() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            r#"{"modules": {"comms": {"enabled": false}}}"#,
            vec![
                ScriptedFactory::new("comms", &[], &log),
                ScriptedFactory::new("ops", &["comms"], &log),
            ],
        );

        loader.discover().unwrap();
        let err = loader.resolve().unwrap_err();
        assert!(matches!(
            err,
            PlateError::MissingDependency { ref reason, .. } if reason == "disabled"
        ));
    }

    #[test]
    fn circular_dependency_reports_cycle_path() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("a", &["b"], &log),
                ScriptedFactory::new("b", &["a"], &log),
            ],
        );

        loader.discover().unwrap();
        let err = loader.resolve().unwrap_err();
        let PlateError::CircularDependency { cycle } = err else {
            panic!("expected CircularDependency, got {err}");
        };
        assert!(cycle.contains(&"a".to_string()));
        assert!(cycle.contains(&"b".to_string()));
        // Nothing was constructed.
        assert!(loader.module_names().is_empty());
    }

    #[test]
    fn disabled_module_is_not_instantiated() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            r#"{"modules": {"sensors": {"enabled": false}}}"#,
            vec![
                ScriptedFactory::new("sensors", &[], &log),
                ScriptedFactory::new("comms", &[], &log),
            ],
        );

        boot(&loader).unwrap();
        assert_eq!(loader.module_names(), vec!["comms"]);
        assert!(loader.module("sensors").is_none());

        let health = loader.run_system_check(Duration::from_secs(1));
        assert!(!health.modules.contains_key("sensors"));
    }

    #[test]
    fn construction_failure_discards_built_modules() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("a", &[], &log),
                ScriptedFactory::new("b", &["a"], &log).failing_build(),
            ],
        );

        loader.discover().unwrap();
        loader.resolve().unwrap();
        let err = loader.instantiate().unwrap_err();
        assert!(matches!(err, PlateError::ModuleLoad { ref module, .. } if module == "b"));

        // "a" was constructed first but is discarded, never started.
        assert!(loader.module("a").is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn start_failure_rolls_back_in_reverse_order() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("a", &[], &log),
                ScriptedFactory::new("b", &["a"], &log),
                ScriptedFactory::new("c", &["b"], &log).failing_start(),
            ],
        );

        let err = boot(&loader).unwrap_err();
        assert!(matches!(err, PlateError::ModuleStart { ref module, .. } if module == "c"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "start:c", "stop:b", "stop:a"]
        );
    }

    #[test]
    fn stop_all_is_idempotent() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("a", &[], &log),
                ScriptedFactory::new("b", &["a"], &log),
            ],
        );

        boot(&loader).unwrap();
        loader.stop_all();
        loader.stop_all();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
    }

    #[test]
    fn stop_failure_does_not_halt_teardown() {
        let log: EventLog = Default::default();
        let loader = loader_with(
            "{}",
            vec![
                ScriptedFactory::new("a", &[], &log),
                ScriptedFactory::new("b", &["a"], &log).failing_stop(),
            ],
        );

        boot(&loader).unwrap();
        loader.stop_all();

        // b's failure is logged; a still stops.
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "start:b", "stop:b", "stop:a"]
        );
        assert!(!loader.module("a").unwrap().is_running());
    }

    #[test]
    fn module_accessor_exposes_running_state() {
        let log: EventLog = Default::default();
        let loader = loader_with("{}", vec![ScriptedFactory::new("comms", &[], &log)]);

        boot(&loader).unwrap();
        let handle = loader.module("comms").expect("loaded");
        assert!(handle.is_running());
        assert_eq!(handle.descriptor().version, "1.0.0");
        assert!(loader.module("ghost").is_none());
    }
}
