//! Tunables for scan accounting and controller resources, read from an optional JSON file.

use anyhow::{anyhow, Context};
use log::{warn, LevelFilter};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

/// How many finished scan sessions are remembered per app.
pub const NUM_SCAN_DURATIONS_KEPT: usize = 5;

/// Window in which more than `NUM_SCAN_DURATIONS_KEPT` scan starts are considered abusive.
pub const EXCESSIVE_SCANNING_PERIOD_MS: u64 = 30 * 1000;

/// Scans running longer than this get downgraded to opportunistic mode.
pub const SCAN_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Scan results are reported to battery accounting in batches of this size.
pub const NUM_SCAN_RESULTS_PER_BATTERY_NOTE: u32 = 100;

/// Advertising sets the controller can hold at once.
pub const DEFAULT_MAX_ADVERTISERS: usize = 16;

/// Hardware scan filter slots.
pub const DEFAULT_MAX_SCAN_FILTERS: usize = 16;

/// Connection interval bounds, in 1.25ms units, and peripheral latency per connection priority.
pub const GATT_HIGH_PRIORITY_MIN_INTERVAL: i32 = 9;
pub const GATT_HIGH_PRIORITY_MAX_INTERVAL: i32 = 12;
pub const GATT_HIGH_PRIORITY_LATENCY: i32 = 0;
pub const GATT_BALANCED_PRIORITY_MIN_INTERVAL: i32 = 24;
pub const GATT_BALANCED_PRIORITY_MAX_INTERVAL: i32 = 40;
pub const GATT_BALANCED_PRIORITY_LATENCY: i32 = 0;
pub const GATT_LOW_POWER_MIN_INTERVAL: i32 = 80;
pub const GATT_LOW_POWER_MAX_INTERVAL: i32 = 100;
pub const GATT_LOW_POWER_LATENCY: i32 = 2;

/// Link supervision timeout in 10ms units.
pub const GATT_SUPERVISION_TIMEOUT: i32 = 2000;

#[derive(Clone, Debug, PartialEq)]
pub struct GattConfig {
    pub num_scan_durations_kept: usize,
    pub excessive_scanning_period: Duration,
    pub scan_timeout: Duration,
    pub results_per_battery_note: u32,
    pub max_advertisers: usize,
    pub max_scan_filters: usize,
    pub log_level: LevelFilter,
}

impl Default for GattConfig {
    fn default() -> Self {
        GattConfig {
            num_scan_durations_kept: NUM_SCAN_DURATIONS_KEPT,
            excessive_scanning_period: Duration::from_millis(EXCESSIVE_SCANNING_PERIOD_MS),
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT_MS),
            results_per_battery_note: NUM_SCAN_RESULTS_PER_BATTERY_NOTE,
            max_advertisers: DEFAULT_MAX_ADVERTISERS,
            max_scan_filters: DEFAULT_MAX_SCAN_FILTERS,
            log_level: LevelFilter::Info,
        }
    }
}

impl GattConfig {
    /// Reads the config at `path`. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<GattConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(GattConfig::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        GattConfig::from_json(&content)
    }

    /// Parses a JSON object. Absent or malformed fields keep their defaults.
    pub fn from_json(content: &str) -> anyhow::Result<GattConfig> {
        let value = serde_json::from_str::<Value>(content)?;
        let o = value.as_object().ok_or_else(|| anyhow!("config is not a JSON object"))?;

        let mut config = GattConfig::default();
        if let Some(v) = get_u64(o, "num_scan_durations_kept") {
            config.num_scan_durations_kept = v.max(1) as usize;
        }
        if let Some(v) = get_u64(o, "excessive_scanning_period_ms") {
            config.excessive_scanning_period = Duration::from_millis(v);
        }
        if let Some(v) = get_u64(o, "scan_timeout_ms") {
            config.scan_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get_u64(o, "results_per_battery_note") {
            config.results_per_battery_note = v.clamp(1, u32::MAX as u64) as u32;
        }
        if let Some(v) = get_u64(o, "max_advertisers") {
            config.max_advertisers = v as usize;
        }
        if let Some(v) = get_u64(o, "max_scan_filters") {
            config.max_scan_filters = v as usize;
        }
        if let Some(level) = get_log_level(o) {
            config.log_level = level;
        }

        Ok(config)
    }
}

fn get_u64(o: &Map<String, Value>, key: &str) -> Option<u64> {
    let v = o.get(key)?;
    let parsed = v.as_u64();
    if parsed.is_none() {
        warn!("Ignoring config entry {}={}", key, v);
    }
    parsed
}

fn get_log_level(o: &Map<String, Value>) -> Option<LevelFilter> {
    o.get("log_level")?.as_str()?.parse::<LevelFilter>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        assert_eq!(GattConfig::from_json("{}").unwrap(), GattConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = GattConfig::from_json(
            r#"{"num_scan_durations_kept": 3, "excessive_scanning_period_ms": 1000,
                "max_advertisers": 4, "log_level": "debug"}"#,
        )
        .unwrap();
        assert_eq!(config.num_scan_durations_kept, 3);
        assert_eq!(config.excessive_scanning_period, Duration::from_secs(1));
        assert_eq!(config.max_advertisers, 4);
        assert_eq!(config.max_scan_filters, DEFAULT_MAX_SCAN_FILTERS);
        assert_eq!(config.log_level, LevelFilter::Debug);
    }

    #[test]
    fn test_malformed_entries_keep_defaults() {
        let config =
            GattConfig::from_json(r#"{"scan_timeout_ms": "soon", "log_level": 7}"#).unwrap();
        assert_eq!(config, GattConfig::default());
    }

    #[test]
    fn test_not_an_object() {
        assert!(GattConfig::from_json("[1, 2]").is_err());
        assert!(GattConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_missing_file() {
        let config = GattConfig::load("/nonexistent/bt_le_sessions.json").unwrap();
        assert_eq!(config, GattConfig::default());
    }
}
