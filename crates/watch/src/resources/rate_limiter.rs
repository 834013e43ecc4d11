use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Sliding-window limiter over the start times of recent operations.
///
/// Only the newest `max(per_second, per_minute, burst)` starts are kept,
/// which is enough to answer every cap exactly. Entries older than
/// `max(window, 1 min)` are pruned lazily on each check.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            starts: VecDeque::new(),
        }
    }

    fn capacity(&self) -> usize {
        self.config
            .max_operations_per_second
            .max(self.config.max_operations_per_minute)
            .max(self.config.burst_limit)
            .max(1)
    }

    fn retention(&self) -> Duration {
        self.config.window_size.max(MINUTE)
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention()) else {
            return;
        };
        while matches!(self.starts.front(), Some(t) if *t <= cutoff) {
            self.starts.pop_front();
        }
    }

    /// True when one more start at `now` keeps every cap.
    pub fn is_within_limit(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.operations_in(SECOND, now) < self.config.max_operations_per_second
            && self.operations_in(MINUTE, now) < self.config.max_operations_per_minute
            && self.operations_in(self.config.window_size, now) < self.config.burst_limit
    }

    pub fn record(&mut self, now: Instant) {
        self.starts.push_back(now);
        let capacity = self.capacity();
        while self.starts.len() > capacity {
            self.starts.pop_front();
        }
        self.prune(now);
    }

    /// Starts strictly newer than `now - window`.
    pub fn operations_in(&self, window: Duration, now: Instant) -> usize {
        match now.checked_sub(window) {
            Some(cutoff) => self.starts.len() - self.starts.partition_point(|t| *t <= cutoff),
            None => self.starts.len(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: RateLimitConfig) {
        self.config = config;
        let capacity = self.capacity();
        while self.starts.len() > capacity {
            self.starts.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn clear(&mut self) {
        self.starts.clear();
    }

    pub fn shrink_to_fit(&mut self) {
        self.starts.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(per_second: usize, per_minute: usize, burst: usize, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            max_operations_per_second: per_second,
            max_operations_per_minute: per_minute,
            burst_limit: burst,
            window_size: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn per_second_cap_frees_after_one_second() {
        let mut limiter = RateLimiter::new(config(3, 300, 20, 5000));
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limiter.is_within_limit(t0 + Duration::from_millis(i * 10)));
            limiter.record(t0 + Duration::from_millis(i * 10));
        }
        assert!(!limiter.is_within_limit(t0 + Duration::from_millis(500)));
        assert!(!limiter.is_within_limit(t0 + Duration::from_millis(999)));
        assert!(limiter.is_within_limit(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn burst_cap_applies_over_window() {
        let mut limiter = RateLimiter::new(config(100, 300, 5, 2000));
        let t0 = Instant::now();
        for i in 0..5 {
            limiter.record(t0 + Duration::from_millis(i * 300));
        }
        let now = t0 + Duration::from_millis(1500);
        assert_eq!(limiter.operations_in(Duration::from_millis(2000), now), 5);
        assert!(!limiter.is_within_limit(now));
        // The first start leaves the two-second window.
        assert!(limiter.is_within_limit(t0 + Duration::from_millis(2001)));
    }

    #[test]
    fn per_minute_cap_and_pruning() {
        let mut limiter = RateLimiter::new(config(100, 4, 100, 1000));
        let t0 = Instant::now();
        for i in 0..4 {
            limiter.record(t0 + Duration::from_secs(i * 5));
        }
        assert!(!limiter.is_within_limit(t0 + Duration::from_secs(30)));
        assert!(limiter.is_within_limit(t0 + Duration::from_secs(61)));
        assert_eq!(limiter.len(), 3);
    }

    #[test]
    fn history_is_bounded_by_largest_cap() {
        let mut limiter = RateLimiter::new(config(2, 3, 2, 1000));
        let t0 = Instant::now();
        for i in 0..50 {
            limiter.record(t0 + Duration::from_millis(i));
        }
        assert_eq!(limiter.len(), 3);

        limiter.update_config(config(1, 1, 1, 1000));
        assert_eq!(limiter.len(), 1);
        limiter.clear();
        assert!(limiter.is_empty());
    }

    proptest! {
        #[test]
        fn admitted_starts_never_exceed_caps(
            gaps in proptest::collection::vec(0u64..400, 1..200),
            per_second in 1usize..8,
            burst in 1usize..12,
        ) {
            let window = Duration::from_millis(2500);
            let mut limiter = RateLimiter::new(RateLimitConfig {
                max_operations_per_second: per_second,
                max_operations_per_minute: 1000,
                burst_limit: burst,
                window_size: window,
            });
            let t0 = Instant::now();
            let mut offset = 0u64;
            let mut admitted = Vec::new();
            for gap in gaps {
                offset += gap;
                let now = t0 + Duration::from_millis(offset);
                if limiter.is_within_limit(now) {
                    limiter.record(now);
                    admitted.push(now);
                }
            }

            for &t in &admitted {
                let in_second = admitted.iter().filter(|&&s| s <= t && t.duration_since(s) < SECOND).count();
                let in_window = admitted.iter().filter(|&&s| s <= t && t.duration_since(s) < window).count();
                prop_assert!(in_second <= per_second);
                prop_assert!(in_window <= burst);
            }
        }
    }
}
