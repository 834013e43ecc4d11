//! Process sampling, threshold alerts and the bounded metrics history.

pub mod history;
pub mod metrics;
pub mod probe;
pub mod sampler;
pub mod thresholds;

pub use history::MetricsHistory;
pub use metrics::{
    CpuMetrics, FileSystemMetrics, FileSystemMetricsUpdate, MemoryMetrics, PerformanceMetrics,
    WatchMetrics, WatchMetricsUpdate,
};
pub use probe::{CpuTimes, MemorySample, ProcessProbe, ScriptedProbe, SystemProbe};
pub use sampler::{PerformanceMonitor, PerformanceMonitorBuilder, PerformanceSummary, ResourceCheck};
pub use thresholds::{
    metric, ActiveAlerts, AlertCategory, AlertKey, AlertLevel, PerformanceAlert, ThresholdEvaluator,
};
