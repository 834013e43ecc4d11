use common::{JobHandle, JobId, OperationTimer, ScheduledJob, Scheduler};
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::queue::{OperationId, OperationQueue, Pending, PendingOperation, QueuedOperation};
use super::rate_limiter::RateLimiter;
use super::usage::{QueueStatistics, ResourceUsage, ResourceUsageTracker};
use crate::config::{
    PressureConfig, RateLimitConfig, RateLimitConfigUpdate, ResourceLimits, ResourceLimitsUpdate,
};
use crate::errors::{CancelReason, ConfigResult, OperationError, OperationResult};
use crate::events::{WatchEvent, WatchEventBus};
use crate::monitor::PerformanceMetrics;

const QUEUE_JOB: JobId = JobId("watch.queue");
const DEFAULT_QUEUE_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_EVENT_BUFFER: usize = 1024;
const ONE_SECOND: Duration = Duration::from_secs(1);

/// Admission control for watch-mode operations.
///
/// An operation starts at once when a concurrency slot is free, the rate
/// limiter allows it and memory usage is within limits. Otherwise it waits
/// in a priority queue that a periodic processor drains whenever admission
/// holds again. Started operations run on their own tokio tasks and are
/// never cancelled; only queued ones can be.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    events: WatchEventBus,
    scheduler: Scheduler,
    processor: Mutex<Option<JobHandle>>,
    runtime: Handle,
    next_id: AtomicU64,
}

struct ManagerState {
    limits: ResourceLimits,
    pressure: PressureConfig,
    rate_limiter: RateLimiter,
    queue: OperationQueue,
    usage: ResourceUsageTracker,
    shut_down: bool,
}

impl ManagerState {
    fn can_admit(&mut self, now: Instant) -> bool {
        self.usage.active_operations() < self.limits.max_concurrent_operations
            && self.rate_limiter.is_within_limit(now)
            && self.usage.memory_usage() <= self.limits.max_memory_usage
    }

    /// Reserves a slot for `id`. Must follow a successful `can_admit` under
    /// the same lock.
    fn start(&mut self, id: OperationId, now: Instant) -> WatchEvent {
        self.rate_limiter.record(now);
        let (active_operations, total_operations) = self.usage.start(id);
        WatchEvent::OperationStarted {
            operation_id: id,
            active_operations,
            total_operations,
        }
    }
}

/// Holds an operation's concurrency slot until dropped.
struct ActiveSlot {
    id: OperationId,
    success: bool,
    manager: Weak<ManagerInner>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            let active_operations = inner.state.lock().usage.finish(self.id);
            inner.events.emit(WatchEvent::OperationCompleted {
                operation_id: self.id,
                success: self.success,
                active_operations,
            });
        }
    }
}

/// Runs `pending` while owning its slot; the slot is released when this
/// future completes.
async fn run_in_slot(mut slot: ActiveSlot, pending: Box<dyn PendingOperation>) {
    let mut timer = OperationTimer::new("watch.operation");
    timer.add_field("operation_id", slot.id.0);
    slot.success = pending.run().await;
    let outcome: Result<(), &str> = if slot.success {
        Ok(())
    } else {
        Err("operation failed")
    };
    timer.finish_with_result(&outcome);
}

pub struct ResourceManagerBuilder {
    limits: ResourceLimits,
    rate_limit: RateLimitConfig,
    pressure: PressureConfig,
    queue_interval: Duration,
    events: Option<WatchEventBus>,
}

impl Default for ResourceManagerBuilder {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            rate_limit: RateLimitConfig::default(),
            pressure: PressureConfig::default(),
            queue_interval: DEFAULT_QUEUE_INTERVAL,
            events: None,
        }
    }
}

impl ResourceManagerBuilder {
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn pressure(mut self, pressure: PressureConfig) -> Self {
        self.pressure = pressure;
        self
    }

    pub fn queue_interval(mut self, interval: Duration) -> Self {
        self.queue_interval = interval;
        self
    }

    pub fn events(mut self, events: WatchEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the manager and starts its queue processor. Fails outside a
    /// tokio runtime.
    pub fn build(self) -> anyhow::Result<ResourceManager> {
        let runtime = Handle::try_current()?;
        let inner = Arc::new(ManagerInner {
            state: Mutex::new(ManagerState {
                rate_limiter: RateLimiter::new(self.rate_limit),
                limits: self.limits,
                pressure: self.pressure,
                queue: OperationQueue::new(),
                usage: ResourceUsageTracker::new(),
                shut_down: false,
            }),
            events: self
                .events
                .unwrap_or_else(|| WatchEventBus::new(DEFAULT_EVENT_BUFFER)),
            scheduler: Scheduler::new(),
            processor: Mutex::new(None),
            runtime,
            next_id: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        let handle = inner.scheduler.spawn_periodic(
            ScheduledJob {
                id: QUEUE_JOB,
                interval: self.queue_interval,
            },
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ResourceManager { inner }.process_queue();
                    }
                }
            },
        )?;
        *inner.processor.lock() = Some(handle);

        debug!(
            queue_interval_ms = self.queue_interval.as_millis() as u64,
            "resource manager started"
        );
        Ok(ResourceManager { inner })
    }
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits, rate_limit: RateLimitConfig) -> anyhow::Result<Self> {
        Self::builder().limits(limits).rate_limit(rate_limit).build()
    }

    pub fn with_config(
        limits: ResourceLimits,
        rate_limit: RateLimitConfig,
        pressure: PressureConfig,
        queue_interval: Duration,
    ) -> anyhow::Result<Self> {
        Self::builder()
            .limits(limits)
            .rate_limit(rate_limit)
            .pressure(pressure)
            .queue_interval(queue_interval)
            .build()
    }

    pub fn builder() -> ResourceManagerBuilder {
        ResourceManagerBuilder::default()
    }

    pub fn events(&self) -> &WatchEventBus {
        &self.inner.events
    }

    /// Runs `op` now if admission allows, otherwise queues it by `priority`
    /// (higher runs sooner). Resolves to the operation's own result, or to
    /// a cancellation error if it was removed from the queue before it ran.
    pub async fn execute_operation<F, Fut, T>(&self, op: F, priority: i32) -> OperationResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.submit(op, priority)?;
        rx.await
            .unwrap_or(Err(OperationError::Cancelled(CancelReason::Shutdown)))
    }

    fn submit<F, Fut, T>(
        &self,
        op: F,
        priority: i32,
    ) -> OperationResult<tokio::sync::oneshot::Receiver<OperationResult<T>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (pending, rx) = Pending::new(op);
        let id = OperationId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let mut state = self.inner.state.lock();
        // Read the clock under the lock so recorded starts stay ordered.
        let now = Instant::now();
        if state.shut_down {
            return Err(OperationError::ShutDown);
        }

        if state.can_admit(now) {
            let started = state.start(id, now);
            drop(state);
            self.inner.events.emit(started);
            self.launch(id, Box::new(pending));
        } else {
            let queue_size = state.queue.push(id, priority, Box::new(pending), now);
            drop(state);
            debug!(operation_id = %id, queue_size, priority, "operation queued");
            self.inner.events.emit(WatchEvent::OperationQueued {
                operation_id: id,
                queue_size,
                priority,
            });
        }
        Ok(rx)
    }

    fn launch(&self, id: OperationId, pending: Box<dyn PendingOperation>) {
        let slot = ActiveSlot {
            id,
            success: false,
            manager: Arc::downgrade(&self.inner),
        };
        self.inner.runtime.spawn(run_in_slot(slot, pending));
    }

    /// Starts queued operations in priority order while admission holds.
    fn process_queue(&self) {
        loop {
            let (id, pending, started) = {
                let mut state = self.inner.state.lock();
                if state.shut_down || state.queue.is_empty() {
                    return;
                }
                let now = Instant::now();
                if !state.can_admit(now) {
                    return;
                }
                let Some(item) = state.queue.pop() else {
                    return;
                };
                let (id, pending) = item.into_parts();
                let started = state.start(id, now);
                (id, pending, started)
            };
            self.inner.events.emit(started);
            self.launch(id, pending);
        }
    }

    /// Runs `operations` in chunks of `batch_size` (the configured batch
    /// size when `None`), pausing `rate_limit_delay` between chunks.
    ///
    /// Results keep the input order. The first failure in a chunk fails the
    /// whole call immediately; operations that already started keep running
    /// to completion on their own.
    pub async fn execute_batch<I, F, Fut, T>(
        &self,
        operations: I,
        batch_size: Option<usize>,
    ) -> OperationResult<Vec<T>>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let batch_size = match batch_size {
            Some(size) if size > 0 => size,
            _ => self.inner.state.lock().limits.batch_size.max(1),
        };

        let mut remaining = operations.into_iter().peekable();
        let mut results = Vec::new();
        let mut batch_start = 0usize;

        while remaining.peek().is_some() {
            let chunk: Vec<F> = remaining.by_ref().take(batch_size).collect();
            let chunk_len = chunk.len();
            let futures = chunk.into_iter().map(|op| self.execute_operation(op, 0));

            match try_join_all(futures).await {
                Ok(chunk_results) => results.extend(chunk_results),
                Err(e) => {
                    error!(batch_start, "Batch execution failed: {}", e);
                    return Err(e);
                }
            }
            batch_start += chunk_len;

            let delay = self.inner.state.lock().limits.rate_limit_delay;
            if remaining.peek().is_some() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(results)
    }

    /// Advisory signal; admission does not consult it.
    pub fn is_under_resource_pressure(&self) -> bool {
        let mut state = self.inner.state.lock();
        let now = Instant::now();
        let limits = &state.limits;
        let pressure = &state.pressure;

        let memory = state.usage.memory_usage()
            > limits.max_memory_usage * pressure.memory_fraction_of_limit;
        let concurrency = state.usage.active_operations() as f64
            >= limits.max_concurrent_operations as f64 * pressure.concurrency_fraction;
        let backlog = state.queue.len() > pressure.max_queue_depth;

        memory || concurrency || backlog || !state.rate_limiter.is_within_limit(now)
    }

    /// Projects a monitor snapshot into the usage figures used for admission.
    pub fn update_resource_usage(&self, metrics: &PerformanceMetrics) {
        let usage = {
            let mut state = self.inner.state.lock();
            state.usage.record_metrics(metrics);
            state.usage.snapshot(state.queue.len())
        };
        self.inner.events.emit(WatchEvent::ResourceUsageUpdated(usage));
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        let state = self.inner.state.lock();
        state.usage.snapshot(state.queue.len())
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        let state = self.inner.state.lock();
        let now = Instant::now();
        QueueStatistics {
            queue_size: state.queue.len(),
            active_operations: state.usage.active_operations(),
            total_operations: state.usage.total_operations(),
            average_queue_time: state.queue.average_wait(now),
            operations_per_second: state.rate_limiter.operations_in(ONE_SECOND, now),
        }
    }

    /// Cancels every queued operation with [`CancelReason::QueueCleared`].
    /// Running operations are not affected. Returns how many were cancelled.
    pub fn clear_queue(&self) -> usize {
        let drained = self.inner.state.lock().queue.drain();
        self.cancel_all(drained, CancelReason::QueueCleared)
    }

    fn cancel_all(&self, drained: Vec<QueuedOperation>, reason: CancelReason) -> usize {
        let cancelled = drained.len();
        for op in drained {
            op.cancel(reason);
        }
        if cancelled > 0 {
            info!(cancelled, reason = %reason, "cleared operation queue");
        }
        self.inner.events.emit(WatchEvent::QueueCleared { cancelled });
        cancelled
    }

    pub fn update_resource_limits(&self, update: ResourceLimitsUpdate) -> ConfigResult<()> {
        let limits = {
            let mut state = self.inner.state.lock();
            let mut limits = state.limits.clone();
            limits.apply(&update);
            limits.validate()?;
            state.limits = limits.clone();
            limits
        };
        self.inner.events.emit(WatchEvent::ResourceLimitsUpdated(limits));
        Ok(())
    }

    pub fn update_rate_limit_config(&self, update: RateLimitConfigUpdate) -> ConfigResult<()> {
        let config = {
            let mut state = self.inner.state.lock();
            let mut config = state.rate_limiter.config().clone();
            config.apply(&update);
            config.validate()?;
            state.rate_limiter.update_config(config.clone());
            config
        };
        self.inner.events.emit(WatchEvent::RateLimitConfigUpdated(config));
        Ok(())
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        self.inner.state.lock().limits.clone()
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        self.inner.state.lock().rate_limiter.config().clone()
    }

    pub fn pressure_config(&self) -> PressureConfig {
        self.inner.state.lock().pressure.clone()
    }

    /// Releases spare capacity held by the queue, rate history and active
    /// set.
    pub fn force_garbage_collection(&self) {
        {
            let mut state = self.inner.state.lock();
            state.queue.shrink_to_fit();
            state.rate_limiter.shrink_to_fit();
            state.usage.shrink_to_fit();
        }
        debug!("compacted resource manager buffers");
        self.inner.events.emit(WatchEvent::GarbageCollectionForced);
    }

    /// Stops the queue processor, cancels queued operations with
    /// [`CancelReason::Shutdown`] and forgets running ones. Later calls do
    /// nothing; later submissions fail with [`OperationError::ShutDown`].
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.usage.clear_active();
            state.rate_limiter.clear();
            state.queue.drain()
        };
        if let Some(handle) = self.inner.processor.lock().take() {
            handle.stop();
        }
        self.cancel_all(drained, CancelReason::Shutdown);

        info!("resource manager shut down");
        self.inner.events.emit(WatchEvent::Shutdown);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// Queued `(id, priority)` pairs in release order.
    pub fn queued_priorities(&self) -> Vec<(OperationId, i32)> {
        self.inner.state.lock().queue.priorities()
    }
}
