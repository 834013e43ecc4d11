use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::metrics::{CpuMetrics, FileSystemMetrics, MemoryMetrics, PerformanceMetrics, WatchMetrics};
use crate::config::PerformanceThresholds;

/// Metric identifiers carried by alerts. These are the dotted camelCase
/// paths alert consumers match on, not the Rust field names.
pub mod metric {
    pub const MEMORY_USAGE_PERCENTAGE: &str = "memory.usagePercentage";
    pub const MEMORY_HEAP_USED: &str = "memory.heapUsed";
    pub const CPU_USAGE_PERCENTAGE: &str = "cpu.usagePercentage";
    pub const FS_WATCHED_FILES: &str = "fileSystem.watchedFiles";
    pub const FS_OPEN_FILE_DESCRIPTORS: &str = "fileSystem.openFileDescriptors";
    pub const FS_OPERATIONS_PER_SECOND: &str = "fileSystem.fileOperationsPerSecond";
    pub const WATCH_CHANGES_PER_MINUTE: &str = "watch.changesPerMinute";
    pub const WATCH_ERROR_RATE: &str = "watch.errorRate";
    pub const WATCH_RETRANSLATION_TIME: &str = "watch.averageRetranslationTime";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => f.write_str("info"),
            AlertLevel::Warning => f.write_str("warning"),
            AlertLevel::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Memory,
    Cpu,
    FileSystem,
    Watch,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertCategory::Memory => f.write_str("memory"),
            AlertCategory::Cpu => f.write_str("cpu"),
            AlertCategory::FileSystem => f.write_str("filesystem"),
            AlertCategory::Watch => f.write_str("watch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub level: AlertLevel,
    pub category: AlertCategory,
    pub message: String,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub suggestions: Vec<String>,
}

impl PerformanceAlert {
    fn new(
        level: AlertLevel,
        category: AlertCategory,
        metric: &str,
        message: String,
        current_value: f64,
        threshold: f64,
        suggestions: &[&str],
    ) -> Self {
        Self {
            level,
            category,
            message,
            metric: metric.to_string(),
            current_value,
            threshold,
            timestamp: Utc::now(),
            suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey {
            category: self.category,
            metric: self.metric.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub category: AlertCategory,
    pub metric: String,
}

/// Turns a snapshot into candidate alerts. Stateless; deduplication is
/// [`ActiveAlerts`]' job.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    thresholds: PerformanceThresholds,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: PerformanceThresholds) {
        self.thresholds = thresholds;
    }

    pub fn evaluate(&self, metrics: &PerformanceMetrics) -> Vec<PerformanceAlert> {
        let mut alerts = Vec::new();
        self.check_memory(&metrics.memory, &mut alerts);
        self.check_cpu(&metrics.cpu, &mut alerts);
        self.check_file_system(&metrics.file_system, &mut alerts);
        self.check_watch(&metrics.watch, &mut alerts);
        alerts
    }

    fn check_memory(&self, memory: &MemoryMetrics, alerts: &mut Vec<PerformanceAlert>) {
        let t = &self.thresholds.memory;
        let usage = memory.usage_percentage;

        if usage >= t.critical_percentage {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Critical,
                AlertCategory::Memory,
                metric::MEMORY_USAGE_PERCENTAGE,
                format!("Critical memory usage: {:.1}%", usage),
                usage,
                t.critical_percentage,
                &[
                    "Consider reducing batch size",
                    "Limit number of watched files",
                    "Restart the watch process",
                    "Check for memory leaks",
                ],
            ));
        } else if usage >= t.warning_percentage {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::Memory,
                metric::MEMORY_USAGE_PERCENTAGE,
                format!("High memory usage: {:.1}%", usage),
                usage,
                t.warning_percentage,
                &["Monitor memory usage closely", "Consider reducing batch size"],
            ));
        }

        if memory.heap_used >= t.max_heap_size {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Critical,
                AlertCategory::Memory,
                metric::MEMORY_HEAP_USED,
                format!(
                    "Heap size limit exceeded: {:.1}MB",
                    memory.heap_used as f64 / 1024.0 / 1024.0
                ),
                memory.heap_used as f64,
                t.max_heap_size as f64,
                &["Increase heap size limit", "Reduce memory usage", "Restart the process"],
            ));
        }
    }

    fn check_cpu(&self, cpu: &CpuMetrics, alerts: &mut Vec<PerformanceAlert>) {
        let t = &self.thresholds.cpu;
        let usage = cpu.usage_percentage;

        if usage >= t.critical_percentage {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Critical,
                AlertCategory::Cpu,
                metric::CPU_USAGE_PERCENTAGE,
                format!("Critical CPU usage: {:.1}%", usage),
                usage,
                t.critical_percentage,
                &[
                    "Reduce file watching frequency",
                    "Increase debounce delays",
                    "Limit concurrent operations",
                ],
            ));
        } else if usage >= t.warning_percentage {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::Cpu,
                metric::CPU_USAGE_PERCENTAGE,
                format!("High CPU usage: {:.1}%", usage),
                usage,
                t.warning_percentage,
                &["Monitor CPU usage", "Consider optimizing file patterns"],
            ));
        }
    }

    fn check_file_system(&self, fs: &FileSystemMetrics, alerts: &mut Vec<PerformanceAlert>) {
        let t = &self.thresholds.file_system;

        if fs.watched_files >= t.max_watched_files {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::FileSystem,
                metric::FS_WATCHED_FILES,
                format!("Too many watched files: {}", fs.watched_files),
                fs.watched_files as f64,
                t.max_watched_files as f64,
                &[
                    "Reduce file patterns scope",
                    "Use more specific include/exclude patterns",
                    "Consider splitting into multiple watch processes",
                ],
            ));
        }

        if fs.open_file_descriptors >= t.max_file_descriptors {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::FileSystem,
                metric::FS_OPEN_FILE_DESCRIPTORS,
                format!("Many open file descriptors: {}", fs.open_file_descriptors),
                fs.open_file_descriptors as f64,
                t.max_file_descriptors as f64,
                &[
                    "Reduce number of watched directories",
                    "Check for leaked file handles",
                    "Raise the process file descriptor limit",
                ],
            ));
        }

        if fs.file_operations_per_second >= t.max_file_operations_per_second {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::FileSystem,
                metric::FS_OPERATIONS_PER_SECOND,
                format!("High file operation rate: {:.1}/sec", fs.file_operations_per_second),
                fs.file_operations_per_second,
                t.max_file_operations_per_second,
                &[
                    "Increase debounce delay",
                    "Implement rate limiting",
                    "Check for file system loops",
                ],
            ));
        }
    }

    fn check_watch(&self, watch: &WatchMetrics, alerts: &mut Vec<PerformanceAlert>) {
        let t = &self.thresholds.watch;

        if watch.changes_per_minute >= t.max_changes_per_minute {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::Watch,
                metric::WATCH_CHANGES_PER_MINUTE,
                format!("High change rate: {} changes/min", watch.changes_per_minute),
                watch.changes_per_minute,
                t.max_changes_per_minute,
                &[
                    "Increase debounce delay",
                    "Check for file system loops",
                    "Review file patterns",
                ],
            ));
        }

        if watch.error_rate >= t.max_error_rate {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Critical,
                AlertCategory::Watch,
                metric::WATCH_ERROR_RATE,
                format!("High error rate: {:.1}%", watch.error_rate * 100.0),
                watch.error_rate,
                t.max_error_rate,
                &[
                    "Check system resources",
                    "Review error logs",
                    "Consider system degradation",
                ],
            ));
        }

        let max_ms = t.max_retranslation_time.as_secs_f64() * 1000.0;
        if watch.average_retranslation_time_ms >= max_ms {
            alerts.push(PerformanceAlert::new(
                AlertLevel::Warning,
                AlertCategory::Watch,
                metric::WATCH_RETRANSLATION_TIME,
                format!(
                    "Slow retranslation: {}ms average",
                    watch.average_retranslation_time_ms
                ),
                watch.average_retranslation_time_ms,
                max_ms,
                &[
                    "Optimize translation pipeline",
                    "Reduce batch size",
                    "Check API performance",
                ],
            ));
        }
    }
}

/// At most one alert per (category, metric).
#[derive(Debug, Clone, Default)]
pub struct ActiveAlerts {
    alerts: HashMap<AlertKey, PerformanceAlert>,
}

impl ActiveAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `alert` unless an alert of the same level is already active
    /// for its key. Returns whether the alert was recorded (and should be
    /// emitted).
    pub fn admit(&mut self, alert: &PerformanceAlert) -> bool {
        let key = alert.key();
        if let Some(existing) = self.alerts.get(&key) {
            if existing.level == alert.level {
                return false;
            }
        }
        self.alerts.insert(key, alert.clone());
        true
    }

    pub fn get(&self, category: AlertCategory, metric: &str) -> Option<&PerformanceAlert> {
        self.alerts.get(&AlertKey {
            category,
            metric: metric.to_string(),
        })
    }

    pub fn clear(&mut self, category: AlertCategory, metric: &str) -> Option<PerformanceAlert> {
        self.alerts.remove(&AlertKey {
            category,
            metric: metric.to_string(),
        })
    }

    pub fn clear_all(&mut self) {
        self.alerts.clear();
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Active alerts, most severe first.
    pub fn to_vec(&self) -> Vec<PerformanceAlert> {
        let mut alerts: Vec<_> = self.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| b.level.cmp(&a.level).then_with(|| a.metric.cmp(&b.metric)));
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn snapshot() -> PerformanceMetrics {
        PerformanceMetrics {
            memory: MemoryMetrics::default(),
            cpu: CpuMetrics::default(),
            file_system: FileSystemMetrics::default(),
            watch: WatchMetrics::default(),
            timestamp: Utc::now(),
        }
    }

    #[rstest]
    #[case(50.0, None)]
    #[case(70.0, Some(AlertLevel::Warning))]
    #[case(89.9, Some(AlertLevel::Warning))]
    #[case(90.0, Some(AlertLevel::Critical))]
    #[case(99.0, Some(AlertLevel::Critical))]
    fn memory_usage_levels(#[case] usage: f64, #[case] expected: Option<AlertLevel>) {
        let evaluator = ThresholdEvaluator::default();
        let mut metrics = snapshot();
        metrics.memory.usage_percentage = usage;

        let level = evaluator
            .evaluate(&metrics)
            .into_iter()
            .find(|a| a.metric == metric::MEMORY_USAGE_PERCENTAGE)
            .map(|a| a.level);
        assert_eq!(level, expected);
    }

    #[rstest]
    #[case(69.0, None)]
    #[case(75.0, Some(AlertLevel::Warning))]
    #[case(100.0, Some(AlertLevel::Critical))]
    fn cpu_usage_levels(#[case] usage: f64, #[case] expected: Option<AlertLevel>) {
        let evaluator = ThresholdEvaluator::default();
        let mut metrics = snapshot();
        metrics.cpu.usage_percentage = usage;

        let level = evaluator
            .evaluate(&metrics)
            .into_iter()
            .find(|a| a.category == AlertCategory::Cpu)
            .map(|a| a.level);
        assert_eq!(level, expected);
    }

    #[test]
    fn critical_memory_alert_carries_suggestions() {
        let evaluator = ThresholdEvaluator::default();
        let mut metrics = snapshot();
        metrics.memory.usage_percentage = 95.24;

        let alerts = evaluator.evaluate(&metrics);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.threshold, 90.0);
        assert_eq!(alert.message, "Critical memory usage: 95.2%");
        assert_eq!(alert.suggestions.len(), 4);
        assert!(alert
            .suggestions
            .contains(&"Consider reducing batch size".to_string()));
    }

    #[test]
    fn heap_limit_is_evaluated_separately() {
        let evaluator = ThresholdEvaluator::default();
        let mut metrics = snapshot();
        metrics.memory.heap_used = 2 * 1024 * 1024 * 1024;

        let alerts = evaluator.evaluate(&metrics);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, metric::MEMORY_HEAP_USED);
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].message, "Heap size limit exceeded: 2048.0MB");
    }

    #[test]
    fn file_system_and_watch_thresholds() {
        let evaluator = ThresholdEvaluator::default();
        let mut metrics = snapshot();
        metrics.file_system.watched_files = 1500;
        metrics.file_system.open_file_descriptors = 2048;
        metrics.file_system.file_operations_per_second = 150.0;
        metrics.watch.changes_per_minute = 120.0;
        metrics.watch.error_rate = 0.2;
        metrics.watch.average_retranslation_time_ms = 45_000.0;

        let alerts = evaluator.evaluate(&metrics);
        let find = |m: &str| alerts.iter().find(|a| a.metric == m).map(|a| a.level);

        assert_eq!(find(metric::FS_WATCHED_FILES), Some(AlertLevel::Warning));
        assert_eq!(find(metric::FS_OPEN_FILE_DESCRIPTORS), Some(AlertLevel::Warning));
        assert_eq!(find(metric::FS_OPERATIONS_PER_SECOND), Some(AlertLevel::Warning));
        assert_eq!(find(metric::WATCH_CHANGES_PER_MINUTE), Some(AlertLevel::Warning));
        assert_eq!(find(metric::WATCH_ERROR_RATE), Some(AlertLevel::Critical));
        assert_eq!(find(metric::WATCH_RETRANSLATION_TIME), Some(AlertLevel::Warning));
        assert!(alerts.iter().all(|a| (2..=4).contains(&a.suggestions.len())));
    }

    #[test]
    fn custom_retranslation_threshold_is_in_milliseconds() {
        let mut thresholds = PerformanceThresholds::default();
        thresholds.watch.max_retranslation_time = Duration::from_millis(500);
        let evaluator = ThresholdEvaluator::new(thresholds);
        let mut metrics = snapshot();
        metrics.watch.average_retranslation_time_ms = 499.0;
        assert!(evaluator.evaluate(&metrics).is_empty());
        metrics.watch.average_retranslation_time_ms = 500.0;
        assert_eq!(evaluator.evaluate(&metrics)[0].threshold, 500.0);
    }

    #[test]
    fn same_level_is_suppressed_and_level_change_replaces() {
        let evaluator = ThresholdEvaluator::default();
        let mut active = ActiveAlerts::new();
        let mut metrics = snapshot();

        metrics.memory.usage_percentage = 75.0;
        let warning = evaluator.evaluate(&metrics).remove(0);
        assert!(active.admit(&warning));
        assert!(!active.admit(&warning));

        metrics.memory.usage_percentage = 95.0;
        let critical = evaluator.evaluate(&metrics).remove(0);
        assert!(active.admit(&critical));
        assert_eq!(active.len(), 1);
        assert_eq!(
            active
                .get(AlertCategory::Memory, metric::MEMORY_USAGE_PERCENTAGE)
                .map(|a| a.level),
            Some(AlertLevel::Critical)
        );

        assert!(active.admit(&warning));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn clear_removes_single_key() {
        let evaluator = ThresholdEvaluator::default();
        let mut active = ActiveAlerts::new();
        let mut metrics = snapshot();
        metrics.memory.usage_percentage = 95.0;
        metrics.cpu.usage_percentage = 95.0;
        for alert in evaluator.evaluate(&metrics) {
            active.admit(&alert);
        }
        assert_eq!(active.len(), 2);

        assert!(active.clear(AlertCategory::Cpu, metric::CPU_USAGE_PERCENTAGE).is_some());
        assert_eq!(active.len(), 1);
        active.clear_all();
        assert!(active.is_empty());
    }
}
