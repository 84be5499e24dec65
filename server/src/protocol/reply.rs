use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError, Weak},
    task::Poll,
};

use crate::{
    error::ErrorKind,
    model::{Envelope, EnvelopeId},
};

type ReplyResult = Result<Envelope, crate::Error>;

#[derive(Debug, Default)]
struct Waiters {
    released: bool,
    pending: HashMap<EnvelopeId, ReplySender>,
}

/// Correlates inbound replies with the requests waiting for them.
///
/// At most one waiter exists per correlation id. Waiters live in memory only.
#[derive(Debug, Default, Clone)]
pub struct ReplyTracker {
    waiters: Arc<Mutex<Waiters>>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }
    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub fn register(
        &self,
        correlation_id: EnvelopeId,
        deadline: tokio::time::Instant,
    ) -> crate::Result<ReplyHandle> {
        let mut waiters = self.lock();
        if waiters.released {
            return Err(crate::Error::runtime_stopped("register reply waiter"));
        }
        if waiters.pending.contains_key(&correlation_id) {
            return Err(crate::Error::new(
                "register reply waiter",
                ErrorKind::DuplicateCorrelation(correlation_id),
            ));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        waiters
            .pending
            .insert(correlation_id, ReplySender::new(correlation_id, tx));
        Ok(ReplyHandle {
            correlation_id,
            tracker: Arc::downgrade(&self.waiters),
            result: rx,
            deadline: tokio::time::sleep_until(deadline),
        })
    }
    /// Hand `envelope` to the waiter of its correlation id; false if nobody waits for it.
    pub fn on_reply_received(&self, envelope: &Envelope) -> bool {
        let Some(correlation_id) = envelope.correlation_id else {
            return false;
        };
        let sender = self.lock().pending.remove(&correlation_id);
        match sender {
            Some(mut sender) => {
                sender.send(Ok(envelope.clone()));
                true
            }
            None => false,
        }
    }
    /// Drop the waiter of `correlation_id` without resolving it.
    pub fn cancel(&self, correlation_id: EnvelopeId) {
        if let Some(mut sender) = self.lock().pending.remove(&correlation_id) {
            sender.channel.take();
        }
    }
    /// Fail every pending waiter with `RuntimeStopped` and refuse new ones.
    pub fn release_all(&self) -> usize {
        let pending = {
            let mut waiters = self.lock();
            waiters.released = true;
            std::mem::take(&mut waiters.pending)
        };
        let count = pending.len();
        for (_, mut sender) in pending {
            sender.send(Err(crate::Error::runtime_stopped("reply waiter released")));
        }
        if count > 0 {
            tracing::debug!(count, "released reply waiters");
        }
        count
    }
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
    pub fn is_waiting(&self, correlation_id: EnvelopeId) -> bool {
        self.lock().pending.contains_key(&correlation_id)
    }
}

pin_project_lite::pin_project! {
    /// Resolves with the reply, or fails at the deadline.
    pub struct ReplyHandle {
        correlation_id: EnvelopeId,
        tracker: Weak<Mutex<Waiters>>,
        #[pin]
        result: tokio::sync::oneshot::Receiver<ReplyResult>,
        #[pin]
        deadline: tokio::time::Sleep,
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl ReplyHandle {
    pub fn correlation_id(&self) -> EnvelopeId {
        self.correlation_id
    }
    pub async fn wait(self) -> crate::Result<Envelope> {
        self.await
    }
}

impl Future for ReplyHandle {
    type Output = ReplyResult;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(result) = this.result.poll(cx) {
            return Poll::Ready(
                result.unwrap_or_else(|_| Err(crate::Error::runtime_stopped("reply waiter dropped"))),
            );
        }
        if this.deadline.poll(cx).is_ready() {
            if let Some(waiters) = this.tracker.upgrade() {
                waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pending
                    .remove(this.correlation_id);
            }
            tracing::debug!(correlation_id = %this.correlation_id, "reply timeout");
            return Poll::Ready(Err(crate::Error::new(
                format!("waiting reply of {}", this.correlation_id),
                ErrorKind::ReplyTimeout,
            )));
        }
        Poll::Pending
    }
}

#[derive(Debug)]
struct ReplySender {
    correlation_id: EnvelopeId,
    channel: Option<tokio::sync::oneshot::Sender<ReplyResult>>,
}

impl ReplySender {
    fn new(correlation_id: EnvelopeId, channel: tokio::sync::oneshot::Sender<ReplyResult>) -> Self {
        Self {
            correlation_id,
            channel: Some(channel),
        }
    }
    fn send(&mut self, result: ReplyResult) {
        if let Some(channel) = self.channel.take() {
            if channel.send(result).is_err() {
                tracing::debug!(correlation_id = %self.correlation_id, "reply receiver dropped");
            }
        }
    }
}

impl Drop for ReplySender {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.send(Err(crate::Error::runtime_stopped("reply sender dropped")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::model::{MessageType, NodeId};

    fn deadline(ms: u64) -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_millis(ms)
    }

    fn reply_for(correlation_id: EnvelopeId) -> Envelope {
        Envelope::builder(
            MessageType::const_new("Result"),
            Bytes::from_static(b"13"),
            NodeId::new_indexed(1).control_address(),
        )
        .correlation_id(correlation_id)
        .build()
    }

    #[tokio::test]
    async fn test_reply_resolves_waiter() {
        let tracker = ReplyTracker::new();
        let id = EnvelopeId::new_snowflake();
        let handle = tracker.register(id, deadline(1000)).unwrap();
        assert!(tracker.on_reply_received(&reply_for(id)));
        assert!(!tracker.on_reply_received(&reply_for(id)));
        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.correlation_id, Some(id));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_correlation() {
        let tracker = ReplyTracker::new();
        let id = EnvelopeId::new_snowflake();
        let _handle = tracker.register(id, deadline(1000)).unwrap();
        let error = tracker.register(id, deadline(1000)).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::DuplicateCorrelation(dup) if dup == id));
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let tracker = ReplyTracker::new();
        let id = EnvelopeId::new_snowflake();
        let handle = tracker.register(id, deadline(20)).unwrap();
        let error = handle.wait().await.unwrap_err();
        assert!(matches!(error.kind, ErrorKind::ReplyTimeout));
        assert!(!tracker.is_waiting(id));
        assert!(!tracker.on_reply_received(&reply_for(id)));
    }

    #[tokio::test]
    async fn test_release_all() {
        let tracker = ReplyTracker::new();
        let handles = (0..16)
            .map(|_| {
                tracker
                    .register(EnvelopeId::new_snowflake(), deadline(10_000))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(tracker.release_all(), 16);
        for handle in handles {
            assert!(handle.await.unwrap_err().is_runtime_stopped());
        }
        assert!(tracker
            .register(EnvelopeId::new_snowflake(), deadline(10))
            .unwrap_err()
            .is_runtime_stopped());
    }
}
