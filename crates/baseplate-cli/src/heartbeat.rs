//! Bundled `heartbeat` module.
//!
//! Publishes `os.heartbeat {seq, ts}` on a configurable interval so fleet
//! tooling can see the asset is alive. The beat loop runs on its own worker
//! thread; the bus never hosts the wait.
//!
//! Config slice (`modules.heartbeat`):
//!
//! | Key | Default | Meaning |
//! |---|---|---|
//! | `interval_s` | 30.0 | Seconds between beats; must be > 0. |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use baseplate_bus::MessageBus;
use baseplate_kernel::{Module, ModuleDescriptor, ModuleFactory};
use baseplate_types::{HealthReport, PlateError};

const DEFAULT_INTERVAL_S: f64 = 30.0;

/// Heartbeat topic payload: `{"seq": u64, "ts": seconds}`.
pub const HEARTBEAT_TOPIC: &str = "os.heartbeat";

pub struct HeartbeatFactory;

impl ModuleFactory for HeartbeatFactory {
    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new("heartbeat", "1.0.0")
    }

    fn build(
        &self,
        bus: Arc<MessageBus>,
        config: Value,
    ) -> Result<Box<dyn Module>, PlateError> {
        let interval_s = config
            .get("interval_s")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_INTERVAL_S);
        let interval = Duration::try_from_secs_f64(interval_s)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                PlateError::Config(format!(
                    "heartbeat interval_s must be positive, got {interval_s}"
                ))
            })?;
        Ok(Box::new(HeartbeatModule {
            bus,
            interval,
            worker: None,
            stop_tx: None,
            beats: Arc::new(AtomicU64::new(0)),
        }))
    }
}

pub struct HeartbeatModule {
    bus: Arc<MessageBus>,
    interval: Duration,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
    beats: Arc<AtomicU64>,
}

impl Module for HeartbeatModule {
    fn start(&mut self) -> Result<(), PlateError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let bus = self.bus.clone();
        let interval = self.interval;
        let beats = self.beats.clone();

        let worker = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let seq = beats.fetch_add(1, Ordering::SeqCst) + 1;
                        let ts = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                        debug!(seq, "heartbeat");
                        bus.publish(HEARTBEAT_TOPIC, json!({ "seq": seq, "ts": ts }));
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| PlateError::ModuleStart {
                module: "heartbeat".to_string(),
                cause: format!("failed to spawn beat worker: {e}"),
            })?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlateError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("heartbeat worker terminated abnormally");
            }
        }
        Ok(())
    }

    fn system_check(&mut self, running: bool) -> Value {
        HealthReport::from_running(running)
            .with_detail("beats", json!(self.beats.load(Ordering::SeqCst)))
            .with_detail("interval_s", json!(self.interval.as_secs_f64()))
            .into_value()
    }
}
