//! Health records produced by the system-check aggregator.
//!
//! Modules report a [`HealthReport`]: `healthy` and `status` at minimum,
//! plus any diagnostic extras they care to attach. The aggregator folds the
//! per-module reports into one [`AggregateHealth`] whose `overall_healthy`
//! is the conjunction of every module's `healthy` flag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Health probe result for a single module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    /// "running", "stopped", "timeout", "error", "invalid_response", or a
    /// module-specific status string.
    pub status: String,
    /// Filled in by the aggregator when the probe failed or timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Module-specific diagnostic fields, preserved verbatim.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl HealthReport {
    /// The default report: healthy iff the module is running.
    pub fn from_running(running: bool) -> Self {
        let status = if running { "running" } else { "stopped" };
        Self {
            healthy: running,
            status: status.to_string(),
            error: None,
            details: Map::new(),
        }
    }

    /// Replacement report for a probe that exceeded the deadline.
    pub fn timed_out(timeout_s: f64) -> Self {
        Self {
            healthy: false,
            status: "timeout".to_string(),
            error: Some(format!("timed out after {timeout_s}s")),
            details: Map::new(),
        }
    }

    /// Replacement report for a probe that failed outright.
    pub fn probe_error(cause: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: "error".to_string(),
            error: Some(cause.into()),
            details: Map::new(),
        }
    }

    /// Replacement report for a probe whose output was not a well-formed
    /// report.
    pub fn invalid(cause: impl Into<String>) -> Self {
        Self {
            healthy: false,
            status: "invalid_response".to_string(),
            error: Some(cause.into()),
            details: Map::new(),
        }
    }

    /// Attach a diagnostic field, builder-style.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// System-wide health: the per-module reports and their conjunction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub overall_healthy: bool,
    pub modules: BTreeMap<String, HealthReport>,
}

impl AggregateHealth {
    /// Build the aggregate from per-module reports; `overall_healthy` is
    /// true iff every report is healthy.
    pub fn from_reports(modules: BTreeMap<String, HealthReport>) -> Self {
        let overall_healthy = modules.values().all(|r| r.healthy);
        Self {
            overall_healthy,
            modules,
        }
    }
}
