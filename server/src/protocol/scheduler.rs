pub mod jobs;
pub mod retry;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    model::EnvelopeStatus,
    protocol::{
        durable::{QueueKind, TransitionOutcome},
        runtime::{Runtime, RuntimeRef},
    },
};

pub use jobs::ScheduledJobs;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Redelivery policy of failed envelopes.
    pub retry: RetryPolicy,
    /// How long completed inbox rows are kept for duplicate detection.
    pub inbox_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            inbox_retention: Duration::from_secs(60 * 60),
        }
    }
}

impl SchedulerConfig {
    /// Completed inbox rows are purged at most this often.
    pub fn purge_interval(&self) -> Duration {
        self.inbox_retention
            .min(Duration::from_secs(60))
            .max(self.poll_interval)
    }
}

/// Polls the store for due envelopes owned by one node and hands them back to delivery.
#[derive(Debug, Clone)]
pub struct DurableScheduler {
    runtime: RuntimeRef,
    config: SchedulerConfig,
    ct: CancellationToken,
}

impl DurableScheduler {
    pub fn new(runtime: RuntimeRef, config: SchedulerConfig, ct: CancellationToken) -> Self {
        Self {
            runtime,
            config,
            ct,
        }
    }
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
    /// Poll once right away and then at every interval until cancelled. A poll that already
    /// started always runs to completion.
    pub async fn run(self) {
        let mut next_purge = tokio::time::Instant::now() + self.config.purge_interval();
        loop {
            if self.ct.is_cancelled() {
                break;
            }
            let Some(runtime) = self.runtime.upgrade() else {
                break;
            };
            match Self::poll(&runtime).await {
                Ok(0) => {}
                Ok(count) => tracing::debug!(count, "scheduled envelopes delivered"),
                Err(e) => tracing::warn!(error = %e, "scheduler poll failed"),
            }
            if tokio::time::Instant::now() >= next_purge {
                if let Err(e) = Self::purge(&runtime, self.config.inbox_retention).await {
                    tracing::warn!(error = %e, "inbox purge failed");
                }
                next_purge = tokio::time::Instant::now() + self.config.purge_interval();
            }
            drop(runtime);
            tokio::select! {
                _ = self.ct.cancelled() => {
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!("durable scheduler stopped");
    }
    /// Reschedule the rows of `runtime` whose delivery was interrupted by a crash or by the
    /// shutdown grace period running out, so the next poll delivers them again.
    pub async fn recover(runtime: &Runtime) -> crate::Result<usize> {
        let owner = runtime.id();
        let unsettled = runtime
            .with_storage("load unsettled envelopes", || {
                runtime.durable().load_unsettled(owner)
            })
            .await?;
        let now = Utc::now();
        let mut recovered = 0;
        for record in unsettled {
            let expected = record.status();
            let mut envelope = record.envelope;
            if let Err(e) = envelope.mark_scheduled(now) {
                tracing::warn!(error = %e, "unsettled envelope in unexpected status");
                continue;
            }
            let outcome = runtime
                .with_storage("reschedule unsettled envelope", || {
                    runtime
                        .durable()
                        .transition(record.queue, envelope.clone(), expected)
                })
                .await?;
            if outcome == TransitionOutcome::Applied {
                tracing::debug!(id = %envelope.id, queue = %record.queue, from = %expected, "unsettled envelope rescheduled");
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(node = %owner, count = recovered, "interrupted envelopes rescheduled");
        }
        Ok(recovered)
    }
    /// Drop completed inbox rows older than `retention`.
    pub async fn purge(runtime: &Runtime, retention: Duration) -> crate::Result<usize> {
        let Some(before) = chrono::TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let purged = runtime
            .with_storage("purge completed envelopes", || {
                runtime.durable().purge_completed(before)
            })
            .await?;
        if purged > 0 {
            tracing::debug!(count = purged, "completed inbox rows purged");
        }
        Ok(purged)
    }
    /// Claim and deliver every due envelope of `runtime`, in `(scheduled_time, id)` order.
    ///
    /// An envelope whose claim loses against another worker is skipped.
    pub async fn poll(runtime: &Runtime) -> crate::Result<usize> {
        let owner = runtime.id();
        let now = Utc::now();
        let due = runtime
            .with_storage("load due envelopes", || runtime.durable().load_due(owner, now))
            .await?;
        let mut delivered = 0;
        for record in due {
            let mut claimed = record.envelope;
            let marked = match record.queue {
                QueueKind::Outgoing => claimed.mark_sent(),
                QueueKind::Incoming => claimed.mark_received(),
            };
            if let Err(e) = marked {
                tracing::warn!(error = %e, "due envelope in unexpected status");
                continue;
            }
            let outcome = runtime
                .with_storage("claim due envelope", || {
                    runtime.durable().transition(
                        record.queue,
                        claimed.clone(),
                        EnvelopeStatus::Scheduled,
                    )
                })
                .await;
            match outcome {
                Ok(TransitionOutcome::Applied) => {}
                Ok(TransitionOutcome::Stale) => {
                    tracing::debug!(id = %claimed.id, "lost claim, skip");
                    continue;
                }
                Err(e) => {
                    // the row stays Scheduled and is due again at the next poll
                    tracing::warn!(id = %claimed.id, error = %e, "claim failed, skip");
                    continue;
                }
            }
            tracing::trace!(id = %claimed.id, queue = %record.queue, "claimed due envelope");
            match record.queue {
                QueueKind::Outgoing => {
                    if let Err(e) = runtime.transmit(claimed).await {
                        tracing::warn!(error = %e, "scheduled send failed");
                    }
                }
                QueueKind::Incoming => runtime.redeliver(claimed).await,
            }
            delivered += 1;
        }
        Ok(delivered)
    }
}
