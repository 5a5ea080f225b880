//! The system-check aggregator: parallel health probes under one deadline.
//!
//! Each module's probe runs on its own worker thread; results come back
//! over a channel and are collected until the shared deadline expires.
//! A probe that misses the deadline is abandoned — its worker may linger in
//! the background, but the aggregator returns on time and records the
//! module as timed out. Probe panics and malformed reports are likewise
//! contained per module, so one bad probe never poisons the aggregate.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use baseplate_types::{AggregateHealth, HealthReport};

use crate::module::ModuleHandle;

/// Probe every handle and fold the results into an [`AggregateHealth`].
///
/// With a zero timeout no workers are spawned; every module is synthesized
/// as timed out immediately.
pub fn run(handles: &[Arc<ModuleHandle>], timeout: Duration) -> AggregateHealth {
    let timeout_s = timeout.as_secs_f64();
    let mut reports: BTreeMap<String, HealthReport> = BTreeMap::new();

    if handles.is_empty() {
        return AggregateHealth::from_reports(reports);
    }
    if timeout.is_zero() {
        for handle in handles {
            reports.insert(handle.name().to_string(), HealthReport::timed_out(timeout_s));
        }
        return AggregateHealth::from_reports(reports);
    }

    type Outcome = std::thread::Result<Value>;
    let (tx, rx) = mpsc::channel::<(String, Outcome)>();
    let mut pending: HashSet<String> = HashSet::new();

    for handle in handles {
        let name = handle.name().to_string();
        let tx = tx.clone();
        let handle = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("syscheck-{name}"))
            .spawn({
                let name = name.clone();
                move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handle.system_check()));
                    // The receiver may already have given up on us.
                    let _ = tx.send((name, outcome));
                }
            });
        match spawned {
            Ok(_) => {
                pending.insert(name);
            }
            Err(e) => {
                reports.insert(name, HealthReport::probe_error(format!("worker spawn failed: {e}")));
            }
        }
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok((name, Ok(value))) => {
                pending.remove(&name);
                reports.insert(name, validate_report(value));
            }
            Ok((name, Err(payload))) => {
                pending.remove(&name);
                warn!(module = %name, "health probe panicked");
                reports.insert(name, HealthReport::probe_error(panic_message(&payload)));
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for name in pending {
        debug!(module = %name, timeout_s, "health probe abandoned after deadline");
        reports.insert(name, HealthReport::timed_out(timeout_s));
    }

    AggregateHealth::from_reports(reports)
}

/// A well-formed report is a JSON object with at least a boolean `healthy`
/// and a string `status`; anything else is replaced wholesale.
fn validate_report(value: Value) -> HealthReport {
    match serde_json::from_value::<HealthReport>(value) {
        Ok(report) => report,
        Err(e) => HealthReport::invalid(format!("malformed health report: {e}")),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "health probe panicked".to_string()
    }
}
