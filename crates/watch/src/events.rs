use common::{EventBus, Routed, Topic};

use crate::config::{RateLimitConfig, ResourceLimits};
use crate::monitor::{PerformanceAlert, PerformanceMetrics};
use crate::resources::{OperationId, ResourceUsage};

pub const TOPIC_METRICS: Topic = Topic("watch.metrics");
pub const TOPIC_ALERT: Topic = Topic("watch.alert");
pub const TOPIC_OPERATION_STARTED: Topic = Topic("watch.operation.started");
pub const TOPIC_OPERATION_COMPLETED: Topic = Topic("watch.operation.completed");
pub const TOPIC_OPERATION_QUEUED: Topic = Topic("watch.operation.queued");
pub const TOPIC_RESOURCE_USAGE: Topic = Topic("watch.resources.usage");
pub const TOPIC_CONFIG: Topic = Topic("watch.config");
pub const TOPIC_QUEUE_CLEARED: Topic = Topic("watch.queue.cleared");
pub const TOPIC_GC: Topic = Topic("watch.gc");
pub const TOPIC_SHUTDOWN: Topic = Topic("watch.shutdown");

/// Everything the monitor and resource manager report to the outside world.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Metrics(Box<PerformanceMetrics>),
    Alert(PerformanceAlert),
    OperationStarted {
        operation_id: OperationId,
        active_operations: usize,
        total_operations: u64,
    },
    OperationCompleted {
        operation_id: OperationId,
        success: bool,
        active_operations: usize,
    },
    OperationQueued {
        operation_id: OperationId,
        queue_size: usize,
        priority: i32,
    },
    ResourceUsageUpdated(ResourceUsage),
    ResourceLimitsUpdated(ResourceLimits),
    RateLimitConfigUpdated(RateLimitConfig),
    QueueCleared {
        cancelled: usize,
    },
    GarbageCollectionForced,
    Shutdown,
}

impl Routed for WatchEvent {
    fn topic(&self) -> Topic {
        match self {
            WatchEvent::Metrics(_) => TOPIC_METRICS,
            WatchEvent::Alert(_) => TOPIC_ALERT,
            WatchEvent::OperationStarted { .. } => TOPIC_OPERATION_STARTED,
            WatchEvent::OperationCompleted { .. } => TOPIC_OPERATION_COMPLETED,
            WatchEvent::OperationQueued { .. } => TOPIC_OPERATION_QUEUED,
            WatchEvent::ResourceUsageUpdated(_) => TOPIC_RESOURCE_USAGE,
            WatchEvent::ResourceLimitsUpdated(_) | WatchEvent::RateLimitConfigUpdated(_) => {
                TOPIC_CONFIG
            }
            WatchEvent::QueueCleared { .. } => TOPIC_QUEUE_CLEARED,
            WatchEvent::GarbageCollectionForced => TOPIC_GC,
            WatchEvent::Shutdown => TOPIC_SHUTDOWN,
        }
    }
}

pub type WatchEventBus = EventBus<WatchEvent>;
