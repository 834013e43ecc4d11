use chrono::Utc;
use common::{EventEnvelope, JobHandle, JobId, ScheduledJob, Scheduler};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::history::MetricsHistory;
use super::metrics::{
    CpuMetrics, FileSystemMetrics, FileSystemMetricsUpdate, MemoryMetrics, PerformanceMetrics,
    WatchMetrics, WatchMetricsUpdate,
};
use super::probe::{CpuTimes, ProcessProbe, SystemProbe};
use super::thresholds::{ActiveAlerts, AlertCategory, AlertLevel, PerformanceAlert, ThresholdEvaluator};
use crate::config::{PerformanceThresholds, ResourceLimits, ResourceLimitsUpdate};
use crate::errors::ConfigResult;
use crate::events::{WatchEvent, WatchEventBus, TOPIC_ALERT, TOPIC_METRICS};

const MONITOR_JOB: JobId = JobId("watch.monitor");
const FILE_OPERATION_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_HISTORY: usize = 1000;
const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Result of comparing the newest snapshot with the hard resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceCheck {
    pub exceeded: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub current: Option<PerformanceMetrics>,
    pub alerts: usize,
    pub resource_violations: Vec<String>,
    /// Age of the oldest retained snapshot
    pub uptime: Duration,
}

/// Samples process metrics on a timer, keeps a bounded history and raises
/// deduplicated threshold alerts.
///
/// Cloning is cheap and every clone shares the same state. The sampling
/// timer only holds a weak reference, so dropping the last clone stops it.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    probe: Arc<dyn SystemProbe>,
    events: WatchEventBus,
    scheduler: Scheduler,
    timer: Mutex<Option<JobHandle>>,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    evaluator: ThresholdEvaluator,
    limits: ResourceLimits,
    history: MetricsHistory,
    alerts: ActiveAlerts,
    cpu_baseline: Option<(CpuTimes, Instant)>,
    file_operations: FileOperationCounter,
    // Externally reported figures, carried into every new snapshot.
    file_system: FileSystemMetrics,
    watch: WatchMetrics,
}

struct FileOperationCounter {
    count: u64,
    window_start: Instant,
}

impl FileOperationCounter {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Operations per second since the window opened. The window restarts
    /// once it is older than a minute.
    fn rate(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start);
        let rate = if elapsed.is_zero() {
            0.0
        } else {
            self.count as f64 / elapsed.as_secs_f64()
        };
        if elapsed > FILE_OPERATION_WINDOW {
            self.count = 0;
            self.window_start = now;
        }
        rate
    }
}

pub struct PerformanceMonitorBuilder {
    thresholds: PerformanceThresholds,
    limits: ResourceLimits,
    probe: Option<Arc<dyn SystemProbe>>,
    events: Option<WatchEventBus>,
    max_history_size: usize,
}

impl Default for PerformanceMonitorBuilder {
    fn default() -> Self {
        Self {
            thresholds: PerformanceThresholds::default(),
            limits: ResourceLimits::default(),
            probe: None,
            events: None,
            max_history_size: DEFAULT_MAX_HISTORY,
        }
    }
}

impl PerformanceMonitorBuilder {
    pub fn thresholds(mut self, thresholds: PerformanceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Publish on an existing bus instead of a private one.
    pub fn events(mut self, events: WatchEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    pub fn build(self) -> PerformanceMonitor {
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(ProcessProbe::new()) as Arc<dyn SystemProbe>);
        let events = self
            .events
            .unwrap_or_else(|| WatchEventBus::new(DEFAULT_EVENT_BUFFER));

        PerformanceMonitor {
            inner: Arc::new(MonitorInner {
                probe,
                events,
                scheduler: Scheduler::new(),
                timer: Mutex::new(None),
                state: Mutex::new(MonitorState {
                    evaluator: ThresholdEvaluator::new(self.thresholds),
                    limits: self.limits,
                    history: MetricsHistory::new(self.max_history_size),
                    alerts: ActiveAlerts::new(),
                    cpu_baseline: None,
                    file_operations: FileOperationCounter::new(),
                    file_system: FileSystemMetrics::default(),
                    watch: WatchMetrics::default(),
                }),
            }),
        }
    }
}

impl PerformanceMonitor {
    pub fn new(thresholds: PerformanceThresholds, limits: ResourceLimits) -> Self {
        Self::builder().thresholds(thresholds).limits(limits).build()
    }

    pub fn with_probe(
        thresholds: PerformanceThresholds,
        limits: ResourceLimits,
        probe: Arc<dyn SystemProbe>,
    ) -> Self {
        Self::builder()
            .thresholds(thresholds)
            .limits(limits)
            .probe(probe)
            .build()
    }

    pub fn builder() -> PerformanceMonitorBuilder {
        PerformanceMonitorBuilder::default()
    }

    /// Starts periodic sampling. Calling it while already running does
    /// nothing. Must be called from within a tokio runtime.
    pub fn start_monitoring(&self, interval: Duration) -> anyhow::Result<()> {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            return Ok(());
        }

        self.reset_cpu_baseline();

        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.spawn_periodic(
            ScheduledJob {
                id: MONITOR_JOB,
                interval,
            },
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        PerformanceMonitor { inner }.collect_metrics();
                    }
                }
            },
        )?;
        *timer = Some(handle);

        info!(interval_ms = interval.as_millis() as u64, "📊 Performance monitoring started");
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.stop();
            info!("📊 Performance monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    fn reset_cpu_baseline(&self) {
        let baseline = match self.inner.probe.cpu_times() {
            Ok(times) => Some((times, Instant::now())),
            Err(e) => {
                debug!("cpu baseline unavailable: {:#}", e);
                None
            }
        };
        self.inner.state.lock().cpu_baseline = baseline;
    }

    /// Takes one sample, records it, evaluates thresholds and publishes the
    /// resulting events. The timer calls this on every tick.
    pub fn collect_metrics(&self) -> PerformanceMetrics {
        let probe = &self.inner.probe;
        let memory = match probe.memory() {
            Ok(sample) => MemoryMetrics::from_sample(&sample),
            Err(e) => {
                debug!("memory sample unavailable: {:#}", e);
                MemoryMetrics::default()
            }
        };
        let cpu_times = probe
            .cpu_times()
            .map_err(|e| debug!("cpu sample unavailable: {:#}", e))
            .ok();
        let open_file_descriptors = probe.open_file_descriptors().unwrap_or_else(|e| {
            debug!("file descriptor count unavailable: {:#}", e);
            0
        });
        let now = Instant::now();

        let (metrics, raised) = {
            let mut state = self.inner.state.lock();

            let cpu = match (cpu_times, state.cpu_baseline) {
                (Some(current), Some((previous, at))) => {
                    let wall = now.saturating_duration_since(at).as_micros() as u64;
                    state.cpu_baseline = Some((current, now));
                    CpuMetrics::from_delta(&previous, &current, wall)
                }
                (Some(current), None) => {
                    state.cpu_baseline = Some((current, now));
                    CpuMetrics::default()
                }
                (None, _) => CpuMetrics::default(),
            };

            let file_system = FileSystemMetrics {
                open_file_descriptors,
                file_operations_per_second: state.file_operations.rate(now),
                ..state.file_system.clone()
            };

            let metrics = PerformanceMetrics {
                memory,
                cpu,
                file_system,
                watch: state.watch.clone(),
                timestamp: Utc::now(),
            };
            state.history.push(metrics.clone());

            let candidates = state.evaluator.evaluate(&metrics);
            let raised: Vec<PerformanceAlert> = candidates
                .into_iter()
                .filter(|alert| state.alerts.admit(alert))
                .collect();
            (metrics, raised)
        };

        for alert in raised {
            log_alert(&alert);
            self.inner.events.emit(WatchEvent::Alert(alert));
        }
        self.inner
            .events
            .emit(WatchEvent::Metrics(Box::new(metrics.clone())));

        metrics
    }

    pub fn record_file_operation(&self) {
        self.inner.state.lock().file_operations.count += 1;
    }

    /// Merges externally owned file system figures into the newest snapshot
    /// and into every later one.
    pub fn update_file_system_metrics(&self, update: FileSystemMetricsUpdate) {
        let mut state = self.inner.state.lock();
        state.file_system.apply(&update);
        if let Some(latest) = state.history.latest_mut() {
            latest.file_system.apply(&update);
        }
    }

    /// Merges externally owned watch activity into the newest snapshot and
    /// into every later one.
    pub fn update_watch_metrics(&self, update: WatchMetricsUpdate) {
        let mut state = self.inner.state.lock();
        state.watch.apply(&update);
        if let Some(latest) = state.history.latest_mut() {
            latest.watch.apply(&update);
        }
    }

    pub fn current_metrics(&self) -> Option<PerformanceMetrics> {
        self.inner.state.lock().history.latest().cloned()
    }

    pub fn metrics_history(&self, limit: Option<usize>) -> Vec<PerformanceMetrics> {
        self.inner.state.lock().history.recent(limit)
    }

    pub fn active_alerts(&self) -> Vec<PerformanceAlert> {
        self.inner.state.lock().alerts.to_vec()
    }

    pub fn clear_alert(&self, category: AlertCategory, metric: &str) -> bool {
        self.inner.state.lock().alerts.clear(category, metric).is_some()
    }

    pub fn clear_all_alerts(&self) {
        self.inner.state.lock().alerts.clear_all();
    }

    pub fn check_resource_limits(&self) -> ResourceCheck {
        let state = self.inner.state.lock();
        let Some(current) = state.history.latest() else {
            return ResourceCheck::default();
        };
        let limits = &state.limits;
        let mut violations = Vec::new();

        let memory_limit = limits.max_memory_usage * 100.0;
        if current.memory.usage_percentage > memory_limit {
            violations.push(format!(
                "Memory usage ({:.1}%) exceeds limit ({:.1}%)",
                current.memory.usage_percentage, memory_limit
            ));
        }
        if current.file_system.watched_files > limits.max_watched_files {
            violations.push(format!(
                "Watched files ({}) exceeds limit ({})",
                current.file_system.watched_files, limits.max_watched_files
            ));
        }

        ResourceCheck {
            exceeded: !violations.is_empty(),
            violations,
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        self.inner.state.lock().limits.clone()
    }

    /// Applies `update` if the resulting limits are valid; otherwise the
    /// current limits are kept.
    pub fn update_resource_limits(&self, update: ResourceLimitsUpdate) -> ConfigResult<()> {
        let mut state = self.inner.state.lock();
        let mut limits = state.limits.clone();
        limits.apply(&update);
        limits.validate()?;
        state.limits = limits;
        Ok(())
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        self.inner.state.lock().evaluator.thresholds().clone()
    }

    pub fn update_thresholds(&self, thresholds: PerformanceThresholds) {
        self.inner.state.lock().evaluator.set_thresholds(thresholds);
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        let resource_violations = self.check_resource_limits().violations;
        let state = self.inner.state.lock();
        let uptime = state
            .history
            .oldest()
            .and_then(|first| (Utc::now() - first.timestamp).to_std().ok())
            .unwrap_or_default();

        PerformanceSummary {
            current: state.history.latest().cloned(),
            alerts: state.alerts.len(),
            resource_violations,
            uptime,
        }
    }

    pub fn events(&self) -> &WatchEventBus {
        &self.inner.events
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<EventEnvelope<WatchEvent>> {
        self.inner.events.subscribe(TOPIC_ALERT)
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<EventEnvelope<WatchEvent>> {
        self.inner.events.subscribe(TOPIC_METRICS)
    }

    /// Releases spare capacity held by the history buffer.
    pub(crate) fn compact(&self) {
        self.inner.state.lock().history.shrink_to_fit();
    }
}

fn log_alert(alert: &PerformanceAlert) {
    let suggestions = alert.suggestions.join("; ");
    match alert.level {
        AlertLevel::Critical => error!(
            category = %alert.category,
            metric = %alert.metric,
            current_value = alert.current_value,
            threshold = alert.threshold,
            suggestions = %suggestions,
            "🚨 {}", alert.message
        ),
        AlertLevel::Warning => warn!(
            category = %alert.category,
            metric = %alert.metric,
            current_value = alert.current_value,
            threshold = alert.threshold,
            suggestions = %suggestions,
            "⚠️ {}", alert.message
        ),
        AlertLevel::Info => info!(
            category = %alert.category,
            metric = %alert.metric,
            "{}", alert.message
        ),
    }
}
