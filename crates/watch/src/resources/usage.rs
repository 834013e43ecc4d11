use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::queue::OperationId;
use crate::monitor::PerformanceMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub active_operations: usize,
    pub queued_operations: usize,
    pub total_operations: u64,
    /// Fraction of memory in use, as last reported by the monitor
    pub memory_usage: f64,
    pub file_handles: u64,
    pub last_operation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queue_size: usize,
    pub active_operations: usize,
    pub total_operations: u64,
    /// Mean time the currently waiting operations have been queued
    pub average_queue_time: Duration,
    /// Operations started during the last second
    pub operations_per_second: usize,
}

/// Bookkeeping for running operations plus the usage figures pushed in
/// from the monitor.
#[derive(Debug, Clone)]
pub struct ResourceUsageTracker {
    active: HashSet<OperationId>,
    total_operations: u64,
    memory_usage: f64,
    file_handles: u64,
    last_operation_time: DateTime<Utc>,
}

impl Default for ResourceUsageTracker {
    fn default() -> Self {
        Self {
            active: HashSet::new(),
            total_operations: 0,
            memory_usage: 0.0,
            file_handles: 0,
            last_operation_time: Utc::now(),
        }
    }
}

impl ResourceUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as running and returns `(active, total)` afterwards.
    pub fn start(&mut self, id: OperationId) -> (usize, u64) {
        self.active.insert(id);
        self.total_operations += 1;
        self.last_operation_time = Utc::now();
        (self.active.len(), self.total_operations)
    }

    /// Removes `id` from the running set and returns the remaining count.
    /// Unknown ids (already cleared by shutdown) are ignored.
    pub fn finish(&mut self, id: OperationId) -> usize {
        self.active.remove(&id);
        self.active.len()
    }

    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    pub fn active_operations(&self) -> usize {
        self.active.len()
    }

    pub fn total_operations(&self) -> u64 {
        self.total_operations
    }

    pub fn memory_usage(&self) -> f64 {
        self.memory_usage
    }

    pub fn record_metrics(&mut self, metrics: &PerformanceMetrics) {
        self.memory_usage = metrics.memory.usage_percentage / 100.0;
        self.file_handles = metrics.file_system.open_file_descriptors;
    }

    pub fn snapshot(&self, queued_operations: usize) -> ResourceUsage {
        ResourceUsage {
            active_operations: self.active.len(),
            queued_operations,
            total_operations: self.total_operations,
            memory_usage: self.memory_usage,
            file_handles: self.file_handles,
            last_operation_time: self.last_operation_time,
        }
    }

    pub fn shrink_to_fit(&mut self) {
        self.active.shrink_to_fit();
    }
}
