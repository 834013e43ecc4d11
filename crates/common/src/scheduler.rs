use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub &'static str);

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: JobId,
    pub interval: Duration,
}

/// Runs periodic jobs on the current tokio runtime.
///
/// Every instance owns its own shutdown channel; there is no global timer.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(8);
        Self {
            inner: Arc::new(Mutex::new(Inner { shutdown_tx: tx })),
        }
    }

    /// Starts `f` every `job.interval`, first firing one interval from now.
    ///
    /// Fails when called outside a tokio runtime. Ticks missed while `f` is
    /// still running are skipped, never queued up.
    pub fn spawn_periodic<F, Fut>(&self, job: ScheduledJob, f: F) -> Result<JobHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("cannot schedule {}: {}", job.id.0, e))?;
        if job.interval.is_zero() {
            return Err(anyhow!("job {} has a zero interval", job.id.0));
        }

        let shutdown_rx = self.inner.lock().shutdown_tx.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = job.id;
        debug!(target: "scheduler", job = id.0, interval_ms = job.interval.as_millis() as u64, "spawning periodic job");
        runtime.spawn(run_periodic(job, shutdown_rx, stop_rx, f));

        Ok(JobHandle { id, stop_tx })
    }

    /// Stops every job spawned from this scheduler.
    pub fn shutdown(&self) {
        let _ = self.inner.lock().shutdown_tx.send(());
    }
}

/// Stop handle for one periodic job. Dropping the handle stops the job.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    stop_tx: watch::Sender<bool>,
}

impl JobHandle {
    pub fn stop(&self) {
        let first = self
            .stop_tx
            .send_if_modified(|stopped| !std::mem::replace(stopped, true));
        if first {
            debug!(target: "scheduler", job = self.id.0, "stop requested");
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_periodic<F, Fut>(
    job: ScheduledJob,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
    mut f: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + job.interval, job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                f().await;
            }
        }
    }
    debug!(target: "scheduler", job = job.id.0, "periodic job stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let c = counter.clone();
        move || {
            c.fetch_add(1, Ordering::Relaxed);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn periodic_job_runs_and_stops() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job = ScheduledJob {
            id: JobId("test.job"),
            interval: Duration::from_millis(20),
        };
        let _handle = sched
            .spawn_periodic(job, counting_job(&counter))
            .expect("spawn");

        tokio::time::sleep(Duration::from_millis(75)).await;
        sched.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let n = counter.load(Ordering::Relaxed);
        assert!(n >= 2, "expected at least 2 ticks, got {}", n);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::Relaxed), n, "job kept running after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_halts_job_and_repeats_harmlessly() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = sched
            .spawn_periodic(
                ScheduledJob {
                    id: JobId("test.stop"),
                    interval: Duration::from_millis(10),
                },
                counting_job(&counter),
            )
            .expect("spawn");

        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.stop();
        handle.stop();
        let frozen = counter.load(Ordering::Relaxed);
        assert_eq!(frozen, 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Relaxed), frozen);
        drop(handle);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job = ScheduledJob {
            id: JobId("test.delay"),
            interval: Duration::from_millis(100),
        };
        let _handle = sched
            .spawn_periodic(job, counting_job(&counter))
            .expect("spawn");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_only_that_job() {
        let sched = Scheduler::new();
        let kept = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let interval = Duration::from_millis(10);

        let _kept_handle = sched
            .spawn_periodic(ScheduledJob { id: JobId("kept"), interval }, counting_job(&kept))
            .expect("spawn kept");
        let dropped_handle = sched
            .spawn_periodic(ScheduledJob { id: JobId("dropped"), interval }, counting_job(&dropped))
            .expect("spawn dropped");

        tokio::time::sleep(Duration::from_millis(35)).await;
        drop(dropped_handle);
        let frozen = dropped.load(Ordering::Relaxed);
        let before = kept.load(Ordering::Relaxed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dropped.load(Ordering::Relaxed), frozen);
        assert!(kept.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn spawn_outside_runtime_is_an_error() {
        let sched = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let job = ScheduledJob {
            id: JobId("no.runtime"),
            interval: Duration::from_millis(10),
        };
        assert!(sched.spawn_periodic(job, counting_job(&counter)).is_err());
    }
}
