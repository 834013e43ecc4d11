use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::{CancelReason, OperationError, OperationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op_{}", self.0)
    }
}

/// A submitted unit of work together with the channel its caller waits on.
pub trait PendingOperation: Send {
    /// Runs the work and delivers its outcome. Resolves to `true` on success.
    fn run(self: Box<Self>) -> BoxFuture<'static, bool>;

    /// Tells the caller the work will never run.
    fn cancel(self: Box<Self>, reason: CancelReason);
}

pub(crate) struct Pending<F, T> {
    op: F,
    tx: oneshot::Sender<OperationResult<T>>,
}

impl<F, T> Pending<F, T> {
    pub(crate) fn new(op: F) -> (Self, oneshot::Receiver<OperationResult<T>>) {
        let (tx, rx) = oneshot::channel();
        (Self { op, tx }, rx)
    }
}

impl<F, Fut, T> PendingOperation for Pending<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, bool> {
        let Pending { op, tx } = *self;
        async move {
            let outcome = match AssertUnwindSafe(async move { op().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(OperationError::Failed(e)),
                Err(panic) => Err(OperationError::Panicked(panic_message(panic.as_ref()))),
            };
            let success = outcome.is_ok();
            // The caller may have stopped waiting; the work still counts.
            let _ = tx.send(outcome);
            success
        }
        .boxed()
    }

    fn cancel(self: Box<Self>, reason: CancelReason) {
        let _ = self.tx.send(Err(OperationError::Cancelled(reason)));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct QueuedOperation {
    pub id: OperationId,
    pub priority: i32,
    pub enqueued_at: Instant,
    seq: u64,
    pending: Box<dyn PendingOperation>,
}

impl QueuedOperation {
    pub fn cancel(self, reason: CancelReason) {
        self.pending.cancel(reason)
    }

    pub(crate) fn into_parts(self) -> (OperationId, Box<dyn PendingOperation>) {
        (self.id, self.pending)
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

// Higher priority first, then earlier arrival.
impl Ord for QueuedOperation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedOperation {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedOperation {}

/// Priority queue of operations waiting for admission. Equal priorities
/// leave in arrival order.
#[derive(Default)]
pub struct OperationQueue {
    heap: BinaryHeap<QueuedOperation>,
    next_seq: u64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues and returns the new queue length.
    pub fn push(
        &mut self,
        id: OperationId,
        priority: i32,
        pending: Box<dyn PendingOperation>,
        now: Instant,
    ) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedOperation {
            id,
            priority,
            enqueued_at: now,
            seq,
            pending,
        });
        self.heap.len()
    }

    pub fn pop(&mut self) -> Option<QueuedOperation> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Empties the queue, returning its items in release order.
    pub fn drain(&mut self) -> Vec<QueuedOperation> {
        let mut items = std::mem::take(&mut self.heap).into_sorted_vec();
        items.reverse();
        items
    }

    /// `(id, priority)` of every waiting operation in release order.
    pub fn priorities(&self) -> Vec<(OperationId, i32)> {
        let mut keys: Vec<_> = self
            .heap
            .iter()
            .map(|op| (op.priority, op.seq, op.id))
            .collect();
        keys.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        keys.into_iter().map(|(priority, _, id)| (id, priority)).collect()
    }

    /// Mean time the waiting operations have spent in the queue so far.
    pub fn average_wait(&self, now: Instant) -> Duration {
        if self.heap.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self
            .heap
            .iter()
            .map(|op| now.saturating_duration_since(op.enqueued_at))
            .sum();
        total / self.heap.len() as u32
    }

    pub fn shrink_to_fit(&mut self) {
        self.heap.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Noop;

    impl PendingOperation for Noop {
        fn run(self: Box<Self>) -> BoxFuture<'static, bool> {
            async { true }.boxed()
        }

        fn cancel(self: Box<Self>, _reason: CancelReason) {}
    }

    fn fill(priorities: &[i32]) -> OperationQueue {
        let mut queue = OperationQueue::new();
        let now = Instant::now();
        for (i, p) in priorities.iter().enumerate() {
            queue.push(OperationId(i as u64), *p, Box::new(Noop), now);
        }
        queue
    }

    #[test]
    fn pops_highest_priority_then_fifo() {
        let mut queue = fill(&[1, 5, 1, 9, 5]);
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|op| op.id.0).collect();
        assert_eq!(order, vec![3, 1, 4, 0, 2]);
    }

    #[test]
    fn drain_and_snapshot_agree_with_pop_order() {
        let mut queue = fill(&[0, 2, 2, -1]);
        let snapshot: Vec<u64> = queue.priorities().iter().map(|(id, _)| id.0).collect();
        assert_eq!(snapshot, vec![1, 2, 0, 3]);

        let drained: Vec<u64> = queue.drain().into_iter().map(|op| op.id.0).collect();
        assert_eq!(drained, snapshot);
        assert!(queue.is_empty());
    }

    #[test]
    fn average_wait_over_waiting_items() {
        let mut queue = OperationQueue::new();
        let t0 = Instant::now();
        queue.push(OperationId(1), 0, Box::new(Noop), t0);
        queue.push(OperationId(2), 0, Box::new(Noop), t0 + Duration::from_millis(100));
        let wait = queue.average_wait(t0 + Duration::from_millis(300));
        assert_eq!(wait, Duration::from_millis(250));
        assert_eq!(OperationQueue::new().average_wait(t0), Duration::ZERO);
    }

    #[tokio::test]
    async fn pending_delivers_result_and_cancellation() {
        let (pending, rx) = Pending::<_, i32>::new(|| async { Ok::<_, anyhow::Error>(7) });
        assert!(Box::new(pending).run().await);
        assert_eq!(rx.await.expect("sent").expect("ok"), 7);

        let (pending, rx) = Pending::<_, u8>::new(|| async { Err::<u8, _>(anyhow::anyhow!("boom")) });
        assert!(!Box::new(pending).run().await);
        let err = rx.await.expect("sent").unwrap_err();
        assert_eq!(err.to_string(), "boom");

        let (pending, rx) = Pending::<_, u8>::new(|| async { Ok::<u8, anyhow::Error>(1) });
        Box::new(pending).cancel(CancelReason::QueueCleared);
        let err = rx.await.expect("sent").unwrap_err();
        assert_eq!(err.cancel_reason(), Some(CancelReason::QueueCleared));
    }

    #[tokio::test]
    async fn panicking_operation_is_reported() {
        let (pending, rx) = Pending::<_, u8>::new(|| async {
            if true {
                panic!("exploded");
            }
            Ok::<u8, anyhow::Error>(0)
        });
        assert!(!Box::new(pending).run().await);
        match rx.await.expect("sent") {
            Err(OperationError::Panicked(msg)) => assert_eq!(msg, "exploded"),
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }

    proptest! {
        #[test]
        fn release_order_is_sorted_and_stable(priorities in proptest::collection::vec(-5i32..5, 0..64)) {
            let mut queue = fill(&priorities);
            let mut released = Vec::new();
            while let Some(op) = queue.pop() {
                released.push((op.priority, op.id.0));
            }
            for pair in released.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                prop_assert!(a.0 > b.0 || (a.0 == b.0 && a.1 < b.1));
            }
            prop_assert_eq!(released.len(), priorities.len());
        }
    }
}
