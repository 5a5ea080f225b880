//! `baseplate-runtime` – OS Orchestration
//!
//! [`OsManager`] owns the bus and the loader and drives the host end to
//! end: configuration ingest, boot (discover → resolve → construct →
//! start), the run loop, and orderly shutdown. While running it serves the
//! reserved bus topics:
//!
//! - `system.check.request` / `module_loader.system_check.request` – run a
//!   system check and publish `system.check.response`.
//! - `system.shutdown.request` – request an orderly shutdown.
//!
//! Shutdown is cooperative and idempotent: a single channel is written by
//! the OS signal trap (SIGINT/SIGTERM) and by the bus subscriber, and the
//! run loop blocks on it. Teardown stops modules in reverse start order and
//! shuts the bus down last.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use baseplate_bus::{MessageBus, Payload};
use baseplate_kernel::{ModuleLoader, ModuleRegistry};
use baseplate_types::{AggregateHealth, Config, PlateError};

/// How many served request ids are remembered for double-emit suppression.
const RECENT_REQUEST_WINDOW: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Boot errors
// ─────────────────────────────────────────────────────────────────────────────

/// The boot step that failed, for the structured fatal log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Discovery,
    Resolution,
    Construction,
    Start,
}

impl BootPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BootPhase::Discovery => "discovery",
            BootPhase::Resolution => "resolution",
            BootPhase::Construction => "construction",
            BootPhase::Start => "start",
        }
    }
}

impl std::fmt::Display for BootPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal boot failure: the phase it happened in plus the underlying error.
#[derive(Error, Debug)]
#[error("boot failed during {phase}: {source}")]
pub struct BootError {
    pub phase: BootPhase,
    #[source]
    pub source: PlateError,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shutdown plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Why the run loop is exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM.
    Signal,
    /// A `system.shutdown.request` arrived on the bus.
    BusRequest(Option<String>),
    /// The embedding host asked directly.
    Host,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "signal"),
            ShutdownReason::BusRequest(Some(reason)) => write!(f, "bus request: {reason}"),
            ShutdownReason::BusRequest(None) => write!(f, "bus request"),
            ShutdownReason::Host => write!(f, "host request"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OsManager
// ─────────────────────────────────────────────────────────────────────────────

/// Core OS manager: owns the [`MessageBus`] and [`ModuleLoader`], and runs
/// the boot / main-loop / shutdown sequence.
pub struct OsManager {
    bus: Arc<MessageBus>,
    loader: Arc<ModuleLoader>,
    default_check_timeout_s: f64,
    shutdown_tx: Sender<ShutdownReason>,
    shutdown_rx: Mutex<Option<Receiver<ShutdownReason>>>,
    shutting_down: AtomicBool,
    wired: AtomicBool,
    served_requests: Arc<Mutex<VecDeque<String>>>,
}

impl OsManager {
    /// Build the host from an already-parsed configuration and the module
    /// registry supplied by the embedding binary.
    pub fn new(config: Config, registry: ModuleRegistry) -> Self {
        let bus = Arc::new(MessageBus::new());
        let default_check_timeout_s = config.system_check_timeout_s();
        let loader = Arc::new(ModuleLoader::new(bus.clone(), config, registry));
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        Self {
            bus,
            loader,
            default_check_timeout_s,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            shutting_down: AtomicBool::new(false),
            wired: AtomicBool::new(false),
            served_requests: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Read the configuration file at `path` and build the host.
    pub fn from_config_path(path: &Path, registry: ModuleRegistry) -> Result<Self, PlateError> {
        let config = Config::load(path)?;
        Ok(Self::new(config, registry))
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn loader(&self) -> Arc<ModuleLoader> {
        self.loader.clone()
    }

    /// Discover, resolve, construct, and start all enabled modules.
    ///
    /// Any failure stops whatever already started and surfaces the phase it
    /// happened in; the run loop must not be entered afterwards.
    pub fn boot(&self) -> Result<(), BootError> {
        info!("BasePlate OS booting");

        self.loader.discover().map_err(|e| BootError {
            phase: BootPhase::Discovery,
            source: e,
        })?;
        self.loader.resolve().map_err(|e| BootError {
            phase: BootPhase::Resolution,
            source: e,
        })?;
        self.loader.instantiate().map_err(|e| BootError {
            phase: BootPhase::Construction,
            source: e,
        })?;
        if let Err(e) = self.loader.start_all() {
            self.loader.stop_all();
            return Err(BootError {
                phase: BootPhase::Start,
                source: e,
            });
        }

        self.bus.publish("os.boot_complete", json!({ "ts": now_seconds() }));
        info!("boot sequence complete");
        Ok(())
    }

    /// Subscribe the host to the reserved topics. Called by [`Self::run`];
    /// embedders driving their own loop may call it directly. Idempotent.
    pub fn wire_reserved_topics(&self) {
        if self.wired.swap(true, Ordering::SeqCst) {
            return;
        }
        let check_handler = self.system_check_handler();
        self.bus.subscribe("system.check.request", check_handler.clone());
        self.bus.subscribe("module_loader.system_check.request", check_handler);

        let tx = self.shutdown_tx.clone();
        self.bus.subscribe("system.shutdown.request", move |payload: &Payload| {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            let _ = tx.send(ShutdownReason::BusRequest(reason));
            Ok(())
        });
    }

    /// Block until shutdown is requested by signal, bus, or
    /// [`Self::request_shutdown`], then tear down.
    pub fn run(&self) {
        self.wire_reserved_topics();

        let tx = self.shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            let _ = tx.send(ShutdownReason::Signal);
        }) {
            warn!(error = %e, "failed to install signal handler; signal-driven shutdown unavailable");
        }

        info!("entering main loop");
        let receiver = self.shutdown_rx.lock().unwrap_or_else(|p| p.into_inner()).take();
        match receiver {
            Some(rx) => match rx.recv() {
                Ok(reason) => info!(%reason, "shutdown requested"),
                Err(_) => error!("shutdown channel closed unexpectedly"),
            },
            None => warn!("run() called more than once; shutting down"),
        }

        self.shutdown();
    }

    /// Ask the run loop to exit. Safe from any thread.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let _ = self.shutdown_tx.send(reason);
    }

    /// Reverse of boot: stop modules in reverse start order, then shut the
    /// bus down. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.bus.publish("os.shutdown", json!({}));
        self.loader.stop_all();
        self.bus.shutdown();
        info!("OS halted");
    }

    /// Run a system check directly, outside the bus. `timeout` defaults to
    /// the configured deadline.
    pub fn system_check(&self, timeout: Option<Duration>) -> AggregateHealth {
        let timeout = timeout.unwrap_or_else(|| check_timeout(self.default_check_timeout_s));
        self.loader.run_system_check(timeout)
    }

    /// The shared handler for both system-check request topics.
    ///
    /// A bounded window of served request ids prevents a second response
    /// when a module forwards `system.check.request` onto the bridge topic.
    fn system_check_handler(
        &self,
    ) -> impl Fn(&Payload) -> Result<(), PlateError> + Clone + Send + Sync + 'static {
        let bus = self.bus.clone();
        let loader = self.loader.clone();
        let default_timeout_s = self.default_check_timeout_s;
        let served = self.served_requests.clone();

        move |payload: &Payload| {
            let request_id = payload
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(id) = &request_id {
                if already_served(&served, id) {
                    return Ok(());
                }
            }

            let timeout_s = payload
                .get("timeout_s")
                .and_then(Value::as_f64)
                .filter(|t| *t >= 0.0)
                .unwrap_or(default_timeout_s);

            info!(request_id = request_id.as_deref(), timeout_s, "running system check");
            let results = loader.run_system_check(check_timeout(timeout_s));

            let mut response = json!({
                "results": results,
                "timestamp": now_seconds(),
            });
            if let Some(id) = request_id {
                response["request_id"] = json!(id);
            }
            bus.publish("system.check.response", response);
            Ok(())
        }
    }
}

fn already_served(served: &Mutex<VecDeque<String>>, request_id: &str) -> bool {
    let mut served = served.lock().unwrap_or_else(|p| p.into_inner());
    if served.iter().any(|s| s == request_id) {
        return true;
    }
    served.push_back(request_id.to_string());
    if served.len() > RECENT_REQUEST_WINDOW {
        served.pop_front();
    }
    false
}

/// Wall-clock seconds with sub-second precision, as the response timestamp.
fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Convert a (possibly hostile) seconds value from config or a bus payload
/// into a deadline, falling back to the stock default when it cannot be
/// represented.
fn check_timeout(timeout_s: f64) -> Duration {
    Duration::try_from_secs_f64(timeout_s).unwrap_or_else(|_| {
        Duration::from_secs_f64(baseplate_types::config::DEFAULT_SYSTEM_CHECK_TIMEOUT_S)
    })
}
