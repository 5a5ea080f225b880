//! [`Config`] – the JSON configuration tree consumed by the host.
//!
//! The core only interprets the `modules` map (per-module slices and the
//! `enabled` flag) and the optional `os` section. Every other top-level
//! section belongs to modules and is passed through untouched. The tree is
//! read-only after load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PlateError;

/// Default hard deadline for a full system check, in seconds.
pub const DEFAULT_SYSTEM_CHECK_TIMEOUT_S: f64 = 5.0;

/// Parsed configuration.
///
/// ```
/// use baseplate_types::Config;
///
/// let cfg = Config::from_str(r#"{"modules": {"comms": {"enabled": false}}}"#).unwrap();
/// assert!(!cfg.module_enabled("comms"));
/// assert!(cfg.module_enabled("sensors"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-module configuration slices, keyed by module name.
    #[serde(default)]
    pub modules: BTreeMap<String, Value>,

    /// Top-level sections owned by modules (e.g. `atlas`), untouched.
    #[serde(flatten)]
    pub sections: Map<String, Value>,
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, PlateError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlateError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_str(&raw)
            .map_err(|e| PlateError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse configuration from a JSON string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The configuration slice for `name`: `modules.<name>`, or an empty
    /// object when absent.
    pub fn module_slice(&self, name: &str) -> Value {
        self.modules
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Whether `name` is enabled: `modules.<name>.enabled`, default true.
    pub fn module_enabled(&self, name: &str) -> bool {
        self.modules
            .get(name)
            .and_then(|slice| slice.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// A passthrough top-level section, if present.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }

    /// The configured system-check deadline in seconds
    /// (`os.system_check_timeout_s`, default 5.0).
    pub fn system_check_timeout_s(&self) -> f64 {
        self.section("os")
            .and_then(|os| os.get("system_check_timeout_s"))
            .and_then(Value::as_f64)
            .filter(|t| *t >= 0.0)
            .unwrap_or(DEFAULT_SYSTEM_CHECK_TIMEOUT_S)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enabled_defaults_to_true() {
        let cfg = Config::from_str(r#"{"modules": {"comms": {}}}"#).unwrap();
        assert!(cfg.module_enabled("comms"));
        // Absent modules are enabled too; the registry decides what exists.
        assert!(cfg.module_enabled("operations"));
    }

    #[test]
    fn disabled_module_is_reported() {
        let cfg =
            Config::from_str(r#"{"modules": {"sensors": {"enabled": false}}}"#).unwrap();
        assert!(!cfg.module_enabled("sensors"));
    }

    #[test]
    fn missing_slice_is_empty_object() {
        let cfg = Config::from_str("{}").unwrap();
        assert_eq!(cfg.module_slice("comms"), json!({}));
    }

    #[test]
    fn slice_returns_module_subtree() {
        let cfg = Config::from_str(
            r#"{"modules": {"comms": {"enabled": true, "gateway_node_id": "!a1b2"}}}"#,
        )
        .unwrap();
        let slice = cfg.module_slice("comms");
        assert_eq!(slice["gateway_node_id"], json!("!a1b2"));
    }

    #[test]
    fn unknown_sections_pass_through() {
        let cfg = Config::from_str(
            r#"{
                "atlas": {"base_url": "http://localhost:8000", "asset": {"id": "asset-001"}},
                "modules": {}
            }"#,
        )
        .unwrap();
        let atlas = cfg.section("atlas").expect("atlas section");
        assert_eq!(atlas["asset"]["id"], json!("asset-001"));
        assert!(cfg.section("nonexistent").is_none());
    }

    #[test]
    fn system_check_timeout_defaults_and_overrides() {
        let cfg = Config::from_str("{}").unwrap();
        assert_eq!(cfg.system_check_timeout_s(), DEFAULT_SYSTEM_CHECK_TIMEOUT_S);

        let cfg =
            Config::from_str(r#"{"os": {"system_check_timeout_s": 2.5}}"#).unwrap();
        assert_eq!(cfg.system_check_timeout_s(), 2.5);

        // Negative values are rejected in favour of the default.
        let cfg =
            Config::from_str(r#"{"os": {"system_check_timeout_s": -1.0}}"#).unwrap();
        assert_eq!(cfg.system_check_timeout_s(), DEFAULT_SYSTEM_CHECK_TIMEOUT_S);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = Config::load(&dir.path().join("config.json"));
        assert!(matches!(result, Err(PlateError::Config(_))));
    }

    #[test]
    fn load_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").expect("write");
        let result = Config::load(&path);
        assert!(matches!(result, Err(PlateError::Config(_))));
    }

    #[test]
    fn load_roundtrip_from_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"modules": {"heartbeat": {"interval_s": 10}}, "atlas": {"base_url": "x"}}"#,
        )
        .expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.module_slice("heartbeat")["interval_s"], json!(10));
        assert!(cfg.section("atlas").is_some());
    }
}
