use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tsuki_scheduler::{Task, TaskUid};

use crate::model::EnvelopeId;

/// In-memory one-shot timers for envelopes that are not persisted.
///
/// Lost on crash; durable envelopes go through the store and the durable scheduler instead.
pub struct ScheduledJobs {
    client: tsuki_scheduler::AsyncSchedulerClient<tsuki_scheduler::runtime::Tokio>,
    ct: CancellationToken,
    runner: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ScheduledJobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJobs")
            .field("released", &self.ct.is_cancelled())
            .finish()
    }
}

impl ScheduledJobs {
    /// Start the timer runner, it must be called inside a tokio runtime.
    pub fn new(tick: Duration) -> Self {
        let ct = CancellationToken::new();
        let runner = tsuki_scheduler::AsyncSchedulerRunner::tokio().with_execute_duration(tick);
        let client = runner.client();
        let running = runner.run_with_shutdown_signal(Box::pin(ct.child_token().cancelled_owned()));
        let handle = tokio::spawn(async move {
            let _ = running.await;
        });
        Self {
            client,
            ct,
            runner: std::sync::Mutex::new(Some(handle)),
        }
    }
    /// Run `job` once at `at`.
    pub fn schedule<F, Fut>(&self, id: EnvelopeId, at: DateTime<Utc>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.ct.is_cancelled() {
            tracing::debug!(%id, "timers released, job dropped");
            return;
        }
        tracing::trace!(%id, %at, "schedule in-memory job");
        self.client.add_task(
            TaskUid::new(id.to_u128()),
            Task::tokio(tsuki_scheduler::schedule::Once::new(at), job),
        );
    }
    pub fn is_released(&self) -> bool {
        self.ct.is_cancelled()
    }
    /// Stop the runner, pending jobs never fire.
    pub async fn release(&self) {
        self.ct.cancel();
        let handle = self
            .runner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(?e, "timer runner exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn test_job_fires_once() {
        let jobs = ScheduledJobs::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        jobs.schedule(
            EnvelopeId::new_snowflake(),
            Utc::now() + chrono::Duration::milliseconds(30),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        jobs.release().await;
        assert!(jobs.is_released());
    }

    #[tokio::test]
    async fn test_released_jobs_never_fire() {
        let jobs = ScheduledJobs::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        jobs.schedule(
            EnvelopeId::new_snowflake(),
            Utc::now() + chrono::Duration::milliseconds(100),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        jobs.release().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
