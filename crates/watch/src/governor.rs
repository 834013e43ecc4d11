//! Couples the performance monitor to the resource manager: every metrics
//! tick feeds admission, and sustained memory pressure triggers compaction.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::events::{WatchEvent, WatchEventBus, TOPIC_ALERT, TOPIC_METRICS, TOPIC_RESOURCE_USAGE};
use crate::monitor::{AlertLevel, PerformanceMonitor, PerformanceSummary};
use crate::resources::{QueueStatistics, ResourceManager, ResourceUsage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStatistics {
    pub performance: PerformanceSummary,
    pub resources: ResourceUsage,
    pub queue: QueueStatistics,
}

pub struct WatchGovernor {
    config: WatchConfig,
    events: WatchEventBus,
    monitor: PerformanceMonitor,
    resources: ResourceManager,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl WatchGovernor {
    /// Builds both components on one shared event bus. Must be called from
    /// within a tokio runtime.
    pub fn new(config: WatchConfig) -> anyhow::Result<Self> {
        let events = WatchEventBus::new(config.monitor.event_buffer);
        let monitor = PerformanceMonitor::builder()
            .thresholds(config.thresholds.clone())
            .limits(config.limits.clone())
            .max_history_size(config.monitor.max_history_size)
            .events(events.clone())
            .build();
        Self::with_monitor(config, monitor)
    }

    /// Like [`WatchGovernor::new`] but with a caller-built monitor, e.g. one
    /// backed by a scripted probe. The monitor's event bus is shared.
    pub fn with_monitor(config: WatchConfig, monitor: PerformanceMonitor) -> anyhow::Result<Self> {
        let events = monitor.events().clone();
        let resources = ResourceManager::builder()
            .limits(config.limits.clone())
            .rate_limit(config.rate_limit.clone())
            .pressure(config.pressure.clone())
            .queue_interval(config.monitor.queue_interval)
            .events(events.clone())
            .build()?;

        Ok(Self {
            config,
            events,
            monitor,
            resources,
            forwarder: Mutex::new(None),
        })
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn events(&self) -> &WatchEventBus {
        &self.events
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Starts sampling and the metrics-to-admission feedback loop. Calling
    /// it again while running does nothing.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() {
            return Ok(());
        }

        // Subscribe before the first tick can publish.
        let metrics_rx = self.events.subscribe(TOPIC_METRICS);
        let usage_rx = self.events.subscribe(TOPIC_RESOURCE_USAGE);
        let alert_rx = self.events.subscribe(TOPIC_ALERT);

        self.monitor.start_monitoring(self.config.monitor.interval)?;
        *forwarder = Some(tokio::spawn(forward_events(
            self.monitor.clone(),
            self.resources.clone(),
            self.config.monitor.gc_memory_fraction,
            metrics_rx,
            usage_rx,
            alert_rx,
        )));

        info!(
            interval_ms = self.config.monitor.interval.as_millis() as u64,
            max_concurrent_operations = self.config.limits.max_concurrent_operations,
            "watch governor started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.forwarder.lock().is_some()
    }

    pub fn statistics(&self) -> PerformanceStatistics {
        PerformanceStatistics {
            performance: self.monitor.performance_summary(),
            resources: self.resources.resource_usage(),
            queue: self.resources.queue_statistics(),
        }
    }

    /// Stops sampling and the feedback loop, then shuts the resource
    /// manager down. Safe to call more than once.
    pub fn shutdown(&self) {
        self.monitor.stop_monitoring();
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
        self.resources.shutdown();
    }
}

impl Drop for WatchGovernor {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.get_mut().take() {
            task.abort();
        }
    }
}

type Receiver = tokio::sync::broadcast::Receiver<common::EventEnvelope<WatchEvent>>;

async fn forward_events(
    monitor: PerformanceMonitor,
    resources: ResourceManager,
    gc_memory_fraction: f64,
    mut metrics_rx: Receiver,
    mut usage_rx: Receiver,
    mut alert_rx: Receiver,
) {
    loop {
        let received = tokio::select! {
            r = metrics_rx.recv() => r,
            r = usage_rx.recv() => r,
            r = alert_rx.recv() => r,
        };

        let envelope = match received {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "governor fell behind on watch events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match envelope.payload {
            WatchEvent::Metrics(metrics) => resources.update_resource_usage(&metrics),
            WatchEvent::ResourceUsageUpdated(usage) if usage.memory_usage > gc_memory_fraction => {
                warn!(
                    memory_usage = usage.memory_usage,
                    "High memory usage detected, compacting buffers"
                );
                monitor.compact();
                resources.force_garbage_collection();
            }
            WatchEvent::Alert(alert) if alert.level == AlertLevel::Critical => {
                info!(metric = %alert.metric, "critical alert raised; consider shedding optional work");
            }
            other => debug!(event = ?other, "governor ignored event"),
        }
    }
    debug!("governor event loop stopped");
}
