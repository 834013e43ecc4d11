use std::collections::VecDeque;

use super::metrics::PerformanceMetrics;

/// Bounded buffer of recent snapshots; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    entries: VecDeque<PerformanceMetrics>,
    max_size: usize,
}

impl MetricsHistory {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(64)),
            max_size,
        }
    }

    pub fn push(&mut self, metrics: PerformanceMetrics) {
        while self.entries.len() >= self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(metrics);
    }

    pub fn latest(&self) -> Option<&PerformanceMetrics> {
        self.entries.back()
    }

    pub(crate) fn latest_mut(&mut self) -> Option<&mut PerformanceMetrics> {
        self.entries.back_mut()
    }

    pub fn oldest(&self) -> Option<&PerformanceMetrics> {
        self.entries.front()
    }

    /// The newest `limit` entries in chronological order, or everything.
    pub fn recent(&self, limit: Option<usize>) -> Vec<PerformanceMetrics> {
        let skip = match limit {
            Some(limit) => self.entries.len().saturating_sub(limit),
            None => 0,
        };
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn shrink_to_fit(&mut self) {
        self.entries.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::metrics::{CpuMetrics, FileSystemMetrics, MemoryMetrics, WatchMetrics};
    use chrono::Utc;

    fn tick(changes: u64) -> PerformanceMetrics {
        PerformanceMetrics {
            memory: MemoryMetrics::default(),
            cpu: CpuMetrics::default(),
            file_system: FileSystemMetrics::default(),
            watch: WatchMetrics {
                total_changes: changes,
                ..Default::default()
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut history = MetricsHistory::new(3);
        for i in 0..5 {
            history.push(tick(i));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.oldest().map(|m| m.watch.total_changes), Some(2));
        assert_eq!(history.latest().map(|m| m.watch.total_changes), Some(4));
    }

    #[test]
    fn recent_returns_newest_in_order() {
        let mut history = MetricsHistory::new(10);
        for i in 0..4 {
            history.push(tick(i));
        }
        let last_two: Vec<u64> = history
            .recent(Some(2))
            .iter()
            .map(|m| m.watch.total_changes)
            .collect();
        assert_eq!(last_two, vec![2, 3]);
        assert_eq!(history.recent(None).len(), 4);
        assert_eq!(history.recent(Some(100)).len(), 4);
        assert!(history.recent(Some(0)).is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut history = MetricsHistory::new(0);
        history.push(tick(1));
        history.push(tick(2));
        assert_eq!(history.len(), 1);
        assert_eq!(history.max_size(), 1);
    }
}
