//! Serializes asynchronous operations against a single rate-limited
//! external resource.
//!
//! Callers submit closures from anywhere; a single worker task drains the
//! queue strictly in submission order, spacing consecutive invocations by at
//! least the configured minimum interval. Retry policy lives at the call
//! site (see `generator`), not here — the queue itself treats success and
//! failure identically.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The worker task has shut down, so the submitted operation can never run.
/// Only happens when the limiter itself was dropped mid-submit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limiter worker is no longer running")]
pub struct SchedulerClosed;

pub struct RateLimiter {
    queue: mpsc::UnboundedSender<Job>,
}

impl RateLimiter {
    /// Spawns the queue worker. Dropping the returned limiter closes the
    /// queue and lets the worker finish whatever is already enqueued.
    pub fn new(min_interval: Duration) -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            let mut last_invocation: Option<Instant> = None;
            while let Some(job) = jobs.recv().await {
                if let Some(last) = last_invocation {
                    let wait = min_interval.saturating_sub(last.elapsed());
                    if !wait.is_zero() {
                        tracing::debug!(wait_ms = wait.as_millis() as u64, "spacing next call");
                        tokio::time::sleep(wait).await;
                    }
                }
                job.await;
                last_invocation = Some(Instant::now());
            }
        });
        Self { queue }
    }

    /// Enqueues `op` and waits for its result. Operations run one at a
    /// time in FIFO submission order; a failing operation only fails its
    /// own caller and never stalls the queue behind it.
    pub async fn submit<T, F, Fut>(&self, op: F) -> Result<T, SchedulerClosed>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = op().await;
            if done_tx.send(result).is_err() {
                // The caller gave up waiting; drop the result and move on.
                tracing::warn!("rate-limited operation finished after its caller went away");
            }
        });
        self.queue.send(job).map_err(|_| SchedulerClosed)?;
        done_rx.await.map_err(|_| SchedulerClosed)
    }
}
