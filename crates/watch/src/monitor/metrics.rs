use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::probe::{CpuTimes, MemorySample};

/// One sampling tick. Never mutated after it is recorded, except for the
/// externally-owned fields of the newest history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub memory: MemoryMetrics,
    pub cpu: CpuMetrics,
    pub file_system: FileSystemMetrics,
    pub watch: WatchMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
    pub array_buffers: u64,
    pub usage_percentage: f64,
}

impl MemoryMetrics {
    pub fn from_sample(sample: &MemorySample) -> Self {
        let used = sample.heap_used.saturating_add(sample.external);
        let total = sample.heap_total.saturating_add(sample.external);
        let usage_percentage = if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            heap_used: sample.heap_used,
            heap_total: sample.heap_total,
            external: sample.external,
            rss: sample.rss,
            array_buffers: sample.array_buffers,
            usage_percentage,
        }
    }
}

/// CPU time spent since the previous tick, in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub user_time: u64,
    pub system_time: u64,
    pub total_time: u64,
    /// Share of wall-clock time since the previous tick, capped at 100
    pub usage_percentage: f64,
}

impl CpuMetrics {
    pub fn from_delta(previous: &CpuTimes, current: &CpuTimes, wall_micros: u64) -> Self {
        let user_time = current.user.saturating_sub(previous.user).as_micros() as u64;
        let system_time = current.system.saturating_sub(previous.system).as_micros() as u64;
        let total_time = user_time + system_time;
        let usage_percentage = if wall_micros > 0 {
            (total_time as f64 / wall_micros as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            user_time,
            system_time,
            total_time,
            usage_percentage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSystemMetrics {
    pub watched_files: u64,
    /// Approximate; zero when the platform cannot report it
    pub open_file_descriptors: u64,
    pub file_operations_per_second: f64,
    pub average_file_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchMetrics {
    pub total_changes: u64,
    pub changes_per_minute: f64,
    pub average_debounce_time_ms: f64,
    pub retranslation_count: u64,
    pub average_retranslation_time_ms: f64,
    /// Fraction in [0, 1]
    pub error_rate: f64,
}

/// Externally-owned file system figures; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSystemMetricsUpdate {
    pub watched_files: Option<u64>,
    pub open_file_descriptors: Option<u64>,
    pub file_operations_per_second: Option<f64>,
    pub average_file_size: Option<u64>,
}

impl FileSystemMetrics {
    pub fn apply(&mut self, update: &FileSystemMetricsUpdate) {
        if let Some(v) = update.watched_files {
            self.watched_files = v;
        }
        if let Some(v) = update.open_file_descriptors {
            self.open_file_descriptors = v;
        }
        if let Some(v) = update.file_operations_per_second {
            self.file_operations_per_second = v;
        }
        if let Some(v) = update.average_file_size {
            self.average_file_size = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchMetricsUpdate {
    pub total_changes: Option<u64>,
    pub changes_per_minute: Option<f64>,
    pub average_debounce_time_ms: Option<f64>,
    pub retranslation_count: Option<u64>,
    pub average_retranslation_time_ms: Option<f64>,
    pub error_rate: Option<f64>,
}

impl WatchMetrics {
    pub fn apply(&mut self, update: &WatchMetricsUpdate) {
        if let Some(v) = update.total_changes {
            self.total_changes = v;
        }
        if let Some(v) = update.changes_per_minute {
            self.changes_per_minute = v;
        }
        if let Some(v) = update.average_debounce_time_ms {
            self.average_debounce_time_ms = v;
        }
        if let Some(v) = update.retranslation_count {
            self.retranslation_count = v;
        }
        if let Some(v) = update.average_retranslation_time_ms {
            self.average_retranslation_time_ms = v;
        }
        if let Some(v) = update.error_rate {
            self.error_rate = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn memory_percentage_counts_external_on_both_sides() {
        let metrics = MemoryMetrics::from_sample(&MemorySample {
            heap_used: 95 * MB,
            heap_total: 100 * MB,
            external: 5 * MB,
            rss: 150 * MB,
            array_buffers: 0,
        });
        assert!((metrics.usage_percentage - 95.238).abs() < 0.01);
        assert_eq!(metrics.rss, 150 * MB);
    }

    #[test]
    fn empty_memory_sample_is_zero_percent() {
        let metrics = MemoryMetrics::from_sample(&MemorySample::default());
        assert_eq!(metrics.usage_percentage, 0.0);
    }

    #[test]
    fn cpu_percentage_is_relative_to_wall_time_and_capped() {
        let previous = CpuTimes {
            user: Duration::from_millis(100),
            system: Duration::from_millis(50),
        };
        let current = CpuTimes {
            user: Duration::from_millis(300),
            system: Duration::from_millis(100),
        };

        let half = CpuMetrics::from_delta(&previous, &current, 500_000);
        assert_eq!(half.user_time, 200_000);
        assert_eq!(half.system_time, 50_000);
        assert_eq!(half.total_time, 250_000);
        assert!((half.usage_percentage - 50.0).abs() < f64::EPSILON);

        let saturated = CpuMetrics::from_delta(&previous, &current, 100_000);
        assert_eq!(saturated.usage_percentage, 100.0);

        let no_wall = CpuMetrics::from_delta(&previous, &current, 0);
        assert_eq!(no_wall.usage_percentage, 0.0);
    }

    #[test]
    fn updates_only_touch_named_fields() {
        let mut watch = WatchMetrics {
            total_changes: 10,
            ..Default::default()
        };
        watch.apply(&WatchMetricsUpdate {
            error_rate: Some(0.25),
            ..Default::default()
        });
        assert_eq!(watch.total_changes, 10);
        assert_eq!(watch.error_rate, 0.25);

        let mut fs = FileSystemMetrics::default();
        fs.apply(&FileSystemMetricsUpdate {
            watched_files: Some(42),
            ..Default::default()
        });
        assert_eq!(fs.watched_files, 42);
        assert_eq!(fs.open_file_descriptors, 0);
    }
}
