//! Inbound and outbound delivery paths of a [`Runtime`].
use std::{future::Future, panic::AssertUnwindSafe};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tracing::Instrument;

use crate::{
    error::Error,
    handler::HandlerFailure,
    model::{
        codec::{decode_frame, encode_frame},
        Address, Envelope, EnvelopeId, EnvelopeStatus, ReplyBody,
    },
    protocol::{
        durable::{DurableError, PersistOutcome, QueueKind},
        transport::FrameReceiver,
    },
};

use super::{EnvelopeEvent, EnvelopeEventKind, Health, Runtime, RuntimeEvent};

impl Runtime {
    /// Run a store operation under the storage retry policy and keep the health flag current.
    pub(crate) async fn with_storage<T, F, Fut>(
        &self,
        operation: &'static str,
        f: F,
    ) -> crate::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DurableError>>,
    {
        match self.config.storage_retry.retry(operation, f).await {
            Ok(value) => {
                let recovered = self.health.send_if_modified(|health| {
                    let changed = *health != Health::Healthy;
                    *health = Health::Healthy;
                    changed
                });
                if recovered {
                    tracing::info!(node = %self.id(), "store reachable again");
                }
                Ok(value)
            }
            Err(e) => {
                if self.health.send_replace(Health::Degraded) == Health::Healthy {
                    tracing::error!(node = %self.id(), error = %e, "store unavailable, runtime degraded");
                }
                Err(Error::new(operation, e))
            }
        }
    }

    pub(crate) fn emit(&self, kind: EnvelopeEventKind, envelope: &Envelope) {
        tracing::trace!(node = %self.id(), id = %envelope.id, ?kind, status = %envelope.status);
        self.observers.emit(RuntimeEvent::Envelope(EnvelopeEvent {
            kind,
            node_id: self.id(),
            service_name: self.service_name.clone(),
            envelope: envelope.clone(),
            time: Utc::now(),
        }));
    }

    /// Route and send a fresh envelope without checking the runtime state.
    pub(crate) async fn submit(&self, mut envelope: Envelope) -> crate::Result<EnvelopeId> {
        if envelope.status != EnvelopeStatus::Created {
            return Err(Error::new(
                "submit envelope",
                crate::model::InvalidTransition {
                    envelope: envelope.id,
                    from: envelope.status,
                    to: EnvelopeStatus::Sent,
                },
            ));
        }
        self.router.resolve(&envelope.destination)?;
        envelope.source = Some(self.id());
        match envelope.scheduled_time {
            Some(at) if at > Utc::now() => self.schedule_outgoing(envelope, at).await,
            _ => self.dispatch_outgoing(envelope).await,
        }
    }

    async fn dispatch_outgoing(&self, mut envelope: Envelope) -> crate::Result<EnvelopeId> {
        let id = envelope.id;
        if envelope.durable {
            let owner = self.id();
            let outcome = self
                .with_storage("persist outgoing", || {
                    self.durable.persist_outgoing(owner, envelope.clone())
                })
                .await?;
            if outcome == PersistOutcome::Duplicate {
                tracing::debug!(%id, "envelope already in the outbox");
                return Ok(id);
            }
        }
        envelope
            .mark_sent()
            .map_err(Error::contextual("send envelope"))?;
        self.transmit(envelope).await?;
        Ok(id)
    }

    async fn schedule_outgoing(
        &self,
        mut envelope: Envelope,
        at: DateTime<Utc>,
    ) -> crate::Result<EnvelopeId> {
        let id = envelope.id;
        envelope
            .mark_scheduled(at)
            .map_err(Error::contextual("schedule envelope"))?;
        if envelope.durable {
            let owner = self.id();
            self.with_storage("persist scheduled outgoing", || {
                self.durable.persist_outgoing(owner, envelope.clone())
            })
            .await?;
        } else {
            self.schedule_local(QueueKind::Outgoing, envelope.clone(), at);
        }
        self.emit(EnvelopeEventKind::Scheduled, &envelope);
        Ok(id)
    }

    /// Put a `Sent` envelope on the wire.
    ///
    /// A transport failure schedules a retry and returns `Ok`; an error means the envelope was
    /// dead-lettered.
    pub(crate) async fn transmit(&self, mut envelope: Envelope) -> crate::Result<()> {
        debug_assert_eq!(envelope.status, EnvelopeStatus::Sent);
        self.emit(EnvelopeEventKind::Sent, &envelope);
        let frame = match encode_frame(self.config.codec, &envelope) {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                self.dead_letter(QueueKind::Outgoing, envelope, e.to_string())
                    .await;
                return Err(Error::new("encode frame", e));
            }
        };
        match self.transport.send(&envelope.destination, frame).await {
            Ok(()) => {
                if envelope.durable {
                    let id = envelope.id;
                    if let Err(e) = self
                        .with_storage("delete outgoing", || self.durable.delete_outgoing(id))
                        .await
                    {
                        tracing::warn!(%id, error = %e, "sent envelope left in the outbox");
                    }
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id = %envelope.id, destination = %envelope.destination, error = %e, "send failed");
                envelope.record_attempt();
                if self
                    .retry_or_dead_letter(QueueKind::Outgoing, envelope, e.to_string())
                    .await
                {
                    Ok(())
                } else {
                    Err(Error::new("send envelope", e))
                }
            }
        }
    }

    /// Decode a frame from a listener and handle it on the in-flight tracker.
    pub(crate) fn accept_frame(&self, frame: Bytes) {
        let envelope = match decode_frame(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(node = %self.id(), error = %e, "undecodable frame dropped");
                return;
            }
        };
        let span = tracing::info_span!(
            "receive",
            node = %self.id(),
            id = %envelope.id,
            message_type = %envelope.message_type
        );
        let runtime = self.clone();
        self.in_flight
            .spawn(async move { runtime.receive(envelope).await }.instrument(span));
    }

    async fn receive(&self, mut envelope: Envelope) {
        debug_assert!(
            envelope.status.can_transition_to(EnvelopeStatus::Received),
            "inbound envelope {} in status {}",
            envelope.id,
            envelope.status
        );
        if let Err(e) = envelope.mark_received() {
            let reason = e.to_string();
            self.dead_letter(QueueKind::Incoming, envelope, reason).await;
            return;
        }
        if envelope.is_reply() && self.replies.on_reply_received(&envelope) {
            self.emit(EnvelopeEventKind::Received, &envelope);
            if envelope.mark_completed().is_ok() {
                self.emit(EnvelopeEventKind::Completed, &envelope);
            }
            return;
        }
        self.persist_and_handle(envelope, 0).await;
    }

    /// Write a durable envelope to the inbox, then run its handler.
    ///
    /// `failures` counts the inbox writes that already failed for this envelope.
    async fn persist_and_handle(&self, envelope: Envelope, failures: u32) {
        if envelope.durable {
            let owner = self.id();
            let persisted = self
                .with_storage("persist incoming", || {
                    self.durable.persist_incoming(owner, envelope.clone())
                })
                .await;
            match persisted {
                Ok(PersistOutcome::Inserted) => {}
                Ok(PersistOutcome::Duplicate) => {
                    tracing::debug!("duplicate delivery discarded");
                    return;
                }
                Err(e) => {
                    // the sender already dropped its outbox row, this node owns the envelope now
                    self.defer_inbox_write(envelope, failures + 1, e.to_string())
                        .await;
                    return;
                }
            }
        }
        self.emit(EnvelopeEventKind::Received, &envelope);
        self.handle_incoming(envelope).await;
    }

    /// Hold an envelope whose inbox write failed in memory and write it again under the retry
    /// policy. Dead-lettered once the policy is exhausted.
    async fn defer_inbox_write(&self, envelope: Envelope, failures: u32, reason: String) {
        let policy = &self.config.scheduler.retry;
        let Some(at) = policy.next_attempt_time(failures, Utc::now()) else {
            let reason = format!("inbox write failed: {reason} (gave up after {failures} writes)");
            self.dead_letter(QueueKind::Incoming, envelope, reason).await;
            return;
        };
        tracing::warn!(id = %envelope.id, %at, failures, error = %reason, "inbox write failed, held in memory");
        let runtime = self.runtime_ref();
        self.jobs.schedule(envelope.id, at, move || {
            let runtime = runtime.clone();
            let envelope = envelope.clone();
            async move {
                let Some(runtime) = runtime.upgrade() else {
                    return;
                };
                runtime.fire_inbox_write(envelope, failures);
            }
        });
    }

    fn fire_inbox_write(&self, envelope: Envelope, failures: u32) {
        if self.state().is_stopped() {
            tracing::warn!(id = %envelope.id, "runtime stopped before the inbox write was retried");
            return;
        }
        let runtime = self.clone();
        self.in_flight
            .spawn(async move { runtime.persist_and_handle(envelope, failures).await });
    }

    /// Hand a claimed `Received` envelope back to its handler.
    pub(crate) async fn redeliver(&self, envelope: Envelope) {
        self.emit(EnvelopeEventKind::Received, &envelope);
        let span = tracing::info_span!(
            "redeliver",
            node = %self.id(),
            id = %envelope.id,
            attempts = envelope.attempts
        );
        self.handle_incoming(envelope).instrument(span).await;
    }

    async fn handle_incoming(&self, mut envelope: Envelope) {
        envelope.record_attempt();
        let outcome = match self.handlers.dispatch(envelope.clone()) {
            Some(handling) => AssertUnwindSafe(handling)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HandlerFailure::Failed("handler panicked".into()))),
            None => {
                tracing::warn!(message_type = %envelope.message_type, "no handler registered, envelope completed");
                Ok(None)
            }
        };
        match outcome {
            Ok(reply) => {
                if let Some(reply) = reply {
                    self.send_reply(&envelope, reply).await;
                }
                self.complete(envelope).await;
            }
            Err(failure) if failure.is_retryable() => {
                tracing::debug!(error = %failure, attempts = envelope.attempts, "handler failed");
                self.retry_or_dead_letter(QueueKind::Incoming, envelope, failure.to_string())
                    .await;
            }
            Err(failure) => {
                self.dead_letter(QueueKind::Incoming, envelope, failure.to_string())
                    .await;
            }
        }
    }

    async fn send_reply(&self, request: &Envelope, body: ReplyBody) {
        let Some(reply) = request.reply(body.message_type, body.payload) else {
            tracing::debug!(id = %request.id, "no reply address, reply dropped");
            return;
        };
        if let Err(e) = self.submit(reply).await {
            tracing::warn!(id = %request.id, error = %e, "reply not sent");
        }
    }

    async fn complete(&self, mut envelope: Envelope) {
        if let Err(e) = envelope.mark_completed() {
            tracing::warn!(error = %e, "envelope not completed");
            return;
        }
        if envelope.durable {
            let id = envelope.id;
            if let Err(e) = self
                .with_storage("mark complete", || self.durable.mark_complete(id))
                .await
            {
                tracing::warn!(%id, error = %e, "completion not recorded");
            }
        }
        self.emit(EnvelopeEventKind::Completed, &envelope);
    }

    /// Schedule the next attempt under the retry policy, or dead-letter once it is exhausted.
    ///
    /// Returns whether a retry was scheduled.
    async fn retry_or_dead_letter(
        &self,
        queue: QueueKind,
        mut envelope: Envelope,
        reason: String,
    ) -> bool {
        let policy = &self.config.scheduler.retry;
        let Some(at) = policy.next_attempt_time(envelope.attempts, Utc::now()) else {
            let reason = format!("{reason} (gave up after {} attempts)", envelope.attempts);
            self.dead_letter(queue, envelope, reason).await;
            return false;
        };
        if let Err(e) = envelope.mark_scheduled(at) {
            self.dead_letter(queue, envelope, e.to_string()).await;
            return false;
        }
        if envelope.durable {
            let owner = self.id();
            if let Err(e) = self
                .with_storage("schedule retry", || {
                    self.durable
                        .schedule_retry(queue, owner, envelope.clone(), at)
                })
                .await
            {
                tracing::error!(id = %envelope.id, error = %e, "retry not persisted");
                return false;
            }
        } else {
            self.schedule_local(queue, envelope.clone(), at);
        }
        tracing::debug!(id = %envelope.id, %queue, %at, attempts = envelope.attempts, "retry scheduled");
        self.emit(EnvelopeEventKind::Scheduled, &envelope);
        true
    }

    async fn dead_letter(&self, queue: QueueKind, mut envelope: Envelope, reason: String) {
        if let Err(e) = envelope.mark_dead_lettered(reason.clone()) {
            tracing::warn!(error = %e, "envelope already terminal");
            return;
        }
        tracing::warn!(id = %envelope.id, %queue, %reason, "envelope dead-lettered");
        if envelope.durable {
            let owner = self.id();
            if let Err(e) = self
                .with_storage("dead-letter", || {
                    self.durable
                        .dead_letter(queue, owner, envelope.clone(), reason.clone())
                })
                .await
            {
                tracing::error!(id = %envelope.id, error = %e, "dead letter not persisted");
            }
        }
        self.emit(EnvelopeEventKind::DeadLettered, &envelope);
    }

    /// Fire a non-durable `Scheduled` envelope from the in-memory timers.
    fn schedule_local(&self, queue: QueueKind, envelope: Envelope, at: DateTime<Utc>) {
        let runtime = self.runtime_ref();
        self.jobs.schedule(envelope.id, at, move || {
            let runtime = runtime.clone();
            let envelope = envelope.clone();
            async move {
                let Some(runtime) = runtime.upgrade() else {
                    return;
                };
                runtime.fire_local(queue, envelope);
            }
        });
    }

    fn fire_local(&self, queue: QueueKind, mut envelope: Envelope) {
        if self.state().is_stopped() {
            return;
        }
        let runtime = self.clone();
        match queue {
            QueueKind::Outgoing => {
                if let Err(e) = envelope.mark_sent() {
                    tracing::warn!(error = %e, "timer fired for a settled envelope");
                    return;
                }
                self.in_flight.spawn(async move {
                    if let Err(e) = runtime.transmit(envelope).await {
                        tracing::warn!(error = %e, "scheduled send failed");
                    }
                });
            }
            QueueKind::Incoming => {
                if let Err(e) = envelope.mark_received() {
                    tracing::warn!(error = %e, "timer fired for a settled envelope");
                    return;
                }
                self.in_flight
                    .spawn(async move { runtime.redeliver(envelope).await });
            }
        }
    }

    /// Park frames a listener never read so the scheduler picks them up after a restart.
    pub(super) async fn park_unread_frames(&self, address: &Address, frames: FrameReceiver) {
        let mut parked = 0usize;
        let mut dropped = 0usize;
        let unread = frames.drain().collect::<Vec<_>>();
        for frame in unread {
            let mut envelope = match decode_frame(&frame) {
                Ok(envelope) => envelope,
                Err(_) => {
                    dropped += 1;
                    continue;
                }
            };
            if !envelope.durable || envelope.mark_scheduled(Utc::now()).is_err() {
                dropped += 1;
                continue;
            }
            let owner = self.id();
            match self
                .with_storage("park unread frame", || {
                    self.durable.persist_incoming(owner, envelope.clone())
                })
                .await
            {
                Ok(PersistOutcome::Inserted) => {
                    parked += 1;
                    self.emit(EnvelopeEventKind::Scheduled, &envelope);
                }
                Ok(PersistOutcome::Duplicate) => dropped += 1,
                Err(e) => {
                    tracing::warn!(id = %envelope.id, error = %e, "unread frame lost");
                    dropped += 1;
                }
            }
        }
        if parked + dropped > 0 {
            tracing::info!(%address, parked, dropped, "unread frames after listener closed");
        }
    }
}
