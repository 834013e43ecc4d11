//! Configuration for the watch-mode monitor and resource manager.
//!
//! Every struct deserialises with `#[serde(default)]`, so a partial TOML file
//! only overrides the keys it names. Durations are written in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::errors::{ConfigError, ConfigResult};

pub const ENV_PREFIX: &str = "WATCH_";

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryThresholds {
    pub warning_percentage: f64,
    pub critical_percentage: f64,
    /// Bytes
    pub max_heap_size: u64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_percentage: 70.0,
            critical_percentage: 90.0,
            max_heap_size: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuThresholds {
    pub warning_percentage: f64,
    pub critical_percentage: f64,
    pub max_sustained_usage: f64,
}

impl Default for CpuThresholds {
    fn default() -> Self {
        Self {
            warning_percentage: 70.0,
            critical_percentage: 90.0,
            max_sustained_usage: 80.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemThresholds {
    pub max_watched_files: u64,
    pub max_file_descriptors: u64,
    pub max_file_operations_per_second: f64,
}

impl Default for FileSystemThresholds {
    fn default() -> Self {
        Self {
            max_watched_files: 1000,
            max_file_descriptors: 1024,
            max_file_operations_per_second: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchThresholds {
    pub max_changes_per_minute: f64,
    /// Fraction of changes that ended in an error (0.1 = 10%)
    pub max_error_rate: f64,
    #[serde(rename = "max_retranslation_time_ms", with = "duration_ms")]
    pub max_retranslation_time: Duration,
}

impl Default for WatchThresholds {
    fn default() -> Self {
        Self {
            max_changes_per_minute: 100.0,
            max_error_rate: 0.1,
            max_retranslation_time: Duration::from_secs(30),
        }
    }
}

/// Warning and critical boundaries evaluated after every metrics tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub memory: MemoryThresholds,
    pub cpu: CpuThresholds,
    pub file_system: FileSystemThresholds,
    pub watch: WatchThresholds,
}

/// Hard limits shared by the monitor (violation checks) and the resource
/// manager (admission and batching).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Fraction of memory in (0, 1]; admission stops above it
    pub max_memory_usage: f64,
    pub max_watched_files: u64,
    pub max_concurrent_operations: usize,
    /// Pause between consecutive batch chunks
    #[serde(rename = "rate_limit_delay_ms", with = "duration_ms")]
    pub rate_limit_delay: Duration,
    pub batch_size: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_usage: 0.8,
            max_watched_files: 1000,
            max_concurrent_operations: 10,
            rate_limit_delay: Duration::from_millis(100),
            batch_size: 50,
        }
    }
}

/// Partial update for [`ResourceLimits`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimitsUpdate {
    pub max_memory_usage: Option<f64>,
    pub max_watched_files: Option<u64>,
    pub max_concurrent_operations: Option<usize>,
    pub rate_limit_delay: Option<Duration>,
    pub batch_size: Option<usize>,
}

impl ResourceLimits {
    pub fn apply(&mut self, update: &ResourceLimitsUpdate) {
        if let Some(v) = update.max_memory_usage {
            self.max_memory_usage = v;
        }
        if let Some(v) = update.max_watched_files {
            self.max_watched_files = v;
        }
        if let Some(v) = update.max_concurrent_operations {
            self.max_concurrent_operations = v;
        }
        if let Some(v) = update.rate_limit_delay {
            self.rate_limit_delay = v;
        }
        if let Some(v) = update.batch_size {
            self.batch_size = v;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.max_memory_usage > 0.0 && self.max_memory_usage <= 1.0) {
            return Err(ConfigError::invalid(
                "limits.max_memory_usage",
                format!("{} is not a fraction in (0, 1]", self.max_memory_usage),
            ));
        }
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::invalid(
                "limits.max_concurrent_operations",
                "must be at least 1",
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("limits.batch_size", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_operations_per_second: usize,
    pub max_operations_per_minute: usize,
    /// Cap on starts inside `window_size`
    pub burst_limit: usize,
    #[serde(rename = "window_size_ms", with = "duration_ms")]
    pub window_size: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_operations_per_second: 10,
            max_operations_per_minute: 300,
            burst_limit: 20,
            window_size: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitConfigUpdate {
    pub max_operations_per_second: Option<usize>,
    pub max_operations_per_minute: Option<usize>,
    pub burst_limit: Option<usize>,
    pub window_size: Option<Duration>,
}

impl RateLimitConfig {
    pub fn apply(&mut self, update: &RateLimitConfigUpdate) {
        if let Some(v) = update.max_operations_per_second {
            self.max_operations_per_second = v;
        }
        if let Some(v) = update.max_operations_per_minute {
            self.max_operations_per_minute = v;
        }
        if let Some(v) = update.burst_limit {
            self.burst_limit = v;
        }
        if let Some(v) = update.window_size {
            self.window_size = v;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("rate_limit.max_operations_per_second", self.max_operations_per_second),
            ("rate_limit.max_operations_per_minute", self.max_operations_per_minute),
            ("rate_limit.burst_limit", self.burst_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be at least 1"));
            }
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::invalid("rate_limit.window_size_ms", "must be positive"));
        }
        Ok(())
    }
}

/// Boundaries for the advisory pressure signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Pressure once memory exceeds this share of `max_memory_usage`
    pub memory_fraction_of_limit: f64,
    /// Pressure once active operations reach this share of the concurrency cap
    pub concurrency_fraction: f64,
    /// Pressure once more than this many operations wait in the queue
    pub max_queue_depth: usize,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            memory_fraction_of_limit: 0.8,
            concurrency_fraction: 0.8,
            max_queue_depth: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    pub max_history_size: usize,
    #[serde(rename = "queue_interval_ms", with = "duration_ms")]
    pub queue_interval: Duration,
    /// Memory fraction above which the governor compacts buffers
    pub gc_memory_fraction: f64,
    /// Capacity of each event topic before slow subscribers lag
    pub event_buffer: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_history_size: 1000,
            queue_interval: Duration::from_millis(100),
            gc_memory_fraction: 0.9,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub thresholds: PerformanceThresholds,
    pub limits: ResourceLimits,
    pub rate_limit: RateLimitConfig,
    pub pressure: PressureConfig,
    pub monitor: MonitorSettings,
}

impl WatchConfig {
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: WatchConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file, then applies `WATCH_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: WatchConfig = toml::from_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        debug!(path = %path.display(), "loaded watch configuration");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `WATCH_*` style key/value overrides; unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> ConfigResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "MAX_CONCURRENT_OPERATIONS" => {
                    self.limits.max_concurrent_operations = parse_var(name, value)?
                }
                "BATCH_SIZE" => self.limits.batch_size = parse_var(name, value)?,
                "RATE_LIMIT_DELAY_MS" => {
                    self.limits.rate_limit_delay = Duration::from_millis(parse_var(name, value)?)
                }
                "MAX_MEMORY_USAGE" => self.limits.max_memory_usage = parse_var(name, value)?,
                "MAX_OPERATIONS_PER_SECOND" => {
                    self.rate_limit.max_operations_per_second = parse_var(name, value)?
                }
                "MONITOR_INTERVAL_MS" => {
                    self.monitor.interval = Duration::from_millis(parse_var(name, value)?)
                }
                _ => continue,
            }
            debug!(variable = name, value, "applied configuration override");
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.limits.validate()?;
        self.rate_limit.validate()?;

        let t = &self.thresholds;
        if t.memory.warning_percentage >= t.memory.critical_percentage {
            return Err(ConfigError::invalid(
                "thresholds.memory",
                "warning_percentage must be below critical_percentage",
            ));
        }
        if t.cpu.warning_percentage >= t.cpu.critical_percentage {
            return Err(ConfigError::invalid(
                "thresholds.cpu",
                "warning_percentage must be below critical_percentage",
            ));
        }
        if self.monitor.interval.is_zero() || self.monitor.queue_interval.is_zero() {
            return Err(ConfigError::invalid("monitor", "intervals must be positive"));
        }
        if self.monitor.max_history_size == 0 {
            return Err(ConfigError::invalid("monitor.max_history_size", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        ConfigError::invalid(format!("{}{}", ENV_PREFIX, name), format!("{:?}: {}", value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_watch_mode_values() {
        let config = WatchConfig::default();
        assert_eq!(config.thresholds.memory.warning_percentage, 70.0);
        assert_eq!(config.thresholds.memory.critical_percentage, 90.0);
        assert_eq!(config.limits.max_concurrent_operations, 10);
        assert_eq!(config.limits.batch_size, 50);
        assert_eq!(config.limits.rate_limit_delay, Duration::from_millis(100));
        assert_eq!(config.rate_limit.burst_limit, 20);
        assert_eq!(config.rate_limit.window_size, Duration::from_secs(5));
        assert_eq!(config.pressure.max_queue_depth, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_merges_over_defaults() {
        let config = WatchConfig::from_toml_str(
            r#"
            [limits]
            max_concurrent_operations = 5
            rate_limit_delay_ms = 250

            [thresholds.memory]
            critical_percentage = 95.0
            "#,
        )
        .expect("parse");

        assert_eq!(config.limits.max_concurrent_operations, 5);
        assert_eq!(config.limits.rate_limit_delay, Duration::from_millis(250));
        assert_eq!(config.limits.batch_size, 50);
        assert_eq!(config.thresholds.memory.critical_percentage, 95.0);
        assert_eq!(config.thresholds.memory.warning_percentage, 70.0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = WatchConfig::from_toml_str("[limits]\nmax_memory_usage = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "limits.max_memory_usage"));

        let err = WatchConfig::from_toml_str("[thresholds.cpu]\nwarning_percentage = 95.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = WatchConfig::from_toml_str("[limits]\nbatch_size = \"ten\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn overrides_apply_prefixed_keys_only() {
        let mut config = WatchConfig::default();
        config
            .apply_overrides([
                ("WATCH_MAX_CONCURRENT_OPERATIONS", "3"),
                ("WATCH_RATE_LIMIT_DELAY_MS", "20"),
                ("WATCH_UNKNOWN", "whatever"),
                ("MAX_CONCURRENT_OPERATIONS", "99"),
            ])
            .expect("overrides");

        assert_eq!(config.limits.max_concurrent_operations, 3);
        assert_eq!(config.limits.rate_limit_delay, Duration::from_millis(20));

        let err = config
            .apply_overrides([("WATCH_BATCH_SIZE", "-1")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "WATCH_BATCH_SIZE"));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[rate_limit]\nmax_operations_per_second = 4\nwindow_size_ms = 1000").expect("write");

        let config = WatchConfig::load(file.path()).expect("load");
        assert_eq!(config.rate_limit.max_operations_per_second, 4);
        assert_eq!(config.rate_limit.window_size, Duration::from_secs(1));

        let missing = WatchConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn partial_updates_keep_unset_fields() {
        let mut limits = ResourceLimits::default();
        limits.apply(&ResourceLimitsUpdate {
            max_concurrent_operations: Some(2),
            ..Default::default()
        });
        assert_eq!(limits.max_concurrent_operations, 2);
        assert_eq!(limits.batch_size, 50);

        let mut rate = RateLimitConfig::default();
        rate.apply(&RateLimitConfigUpdate {
            burst_limit: Some(3),
            ..Default::default()
        });
        assert_eq!(rate.burst_limit, 3);
        assert_eq!(rate.max_operations_per_second, 10);
    }
}
