//! Admission control and performance monitoring for watch mode.
//!
//! [`PerformanceMonitor`] samples the process on a timer and raises leveled
//! alerts; [`ResourceManager`] gates, queues and rate-limits the operations
//! the watcher submits. [`WatchGovernor`] wires the two together.

pub mod config;
pub mod errors;
pub mod events;
pub mod governor;
pub mod monitor;
pub mod resources;

pub use config::{
    CpuThresholds, FileSystemThresholds, MemoryThresholds, MonitorSettings, PerformanceThresholds,
    PressureConfig, RateLimitConfig, RateLimitConfigUpdate, ResourceLimits, ResourceLimitsUpdate,
    WatchConfig, WatchThresholds,
};
pub use errors::{CancelReason, ConfigError, ConfigResult, OperationError, OperationResult};
pub use events::{WatchEvent, WatchEventBus};
pub use governor::{PerformanceStatistics, WatchGovernor};
pub use monitor::{
    AlertCategory, AlertLevel, FileSystemMetricsUpdate, PerformanceAlert, PerformanceMetrics,
    PerformanceMonitor, PerformanceSummary, ResourceCheck, WatchMetricsUpdate,
};
pub use resources::{OperationId, QueueStatistics, ResourceManager, ResourceUsage};
