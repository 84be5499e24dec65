//! Observe one or more runtimes and wait until the activity an action caused has settled.
//!
//! ```ignore
//! let (activity, Json(result)) = TrackedSession::new(sender.clone())
//!     .also_track(receiver.clone())
//!     .invoke_and_wait::<_, Json<QueryResult>>(Json(Query { value: 13 }), receiver.control_address())
//!     .await?;
//! assert_eq!(activity.received().of_type(&Query::MESSAGE_TYPE).len(), 1);
//! ```
use std::{collections::HashSet, future::Future, time::Duration};

use courier::{
    error::ErrorKind,
    model::{Address, EnvelopeId, Message, MessageCodec, MessageType, NodeId},
    protocol::runtime::{EnvelopeEvent, EnvelopeEventKind, Runtime, RuntimeEvent},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A set of runtimes watched together, the first one issues invocations.
#[derive(Debug, Clone)]
pub struct TrackedSession {
    primary: Runtime,
    others: Vec<Runtime>,
    timeout: Duration,
}

impl TrackedSession {
    pub fn new(primary: Runtime) -> Self {
        Self {
            primary,
            others: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
    pub fn also_track(mut self, runtime: Runtime) -> Self {
        self.others.push(runtime);
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn primary(&self) -> &Runtime {
        &self.primary
    }
    fn runtimes(&self) -> impl Iterator<Item = &Runtime> {
        std::iter::once(&self.primary).chain(self.others.iter())
    }

    /// Run `action`, then wait until every envelope the tracked nodes saw is completed or
    /// dead-lettered.
    ///
    /// Fails with [`ErrorKind::ActivityTimeout`] when the activity does not settle in time.
    pub async fn execute_and_wait<T, F, Fut>(
        &self,
        action: F,
    ) -> courier::Result<(TrackedActivity, T)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = courier::Result<T>>,
    {
        let (sink, events) = flume::unbounded();
        for runtime in self.runtimes() {
            runtime.observe(sink.clone());
        }
        drop(sink);
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut activity = TrackedActivity::default();
        let output = match tokio::time::timeout_at(deadline, action()).await {
            Ok(output) => output?,
            Err(_) => return Err(activity_timeout("run tracked action")),
        };
        loop {
            for event in events.try_iter() {
                activity.record(event);
            }
            if activity.is_settled() {
                tracing::debug!(records = activity.records.len(), "tracked activity settled");
                return Ok((activity, output));
            }
            match tokio::time::timeout_at(deadline, events.recv_async()).await {
                Ok(Ok(event)) => activity.record(event),
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(pending = activity.pending.len(), "tracked activity did not settle");
                    return Err(activity_timeout("await tracked activity"));
                }
            }
        }
    }

    /// Request/reply through the primary runtime, waiting for all activity to settle.
    pub async fn invoke_and_wait<M: Message, R: Message>(
        &self,
        message: M,
        destination: Address,
    ) -> courier::Result<(TrackedActivity, R)> {
        let primary = self.primary.clone();
        self.execute_and_wait(|| async move { primary.invoke::<M, R>(message, destination).await })
            .await
    }
}

fn activity_timeout(context: &'static str) -> courier::Error {
    courier::Error::new(context, ErrorKind::ActivityTimeout)
}

/// Envelope events recorded during one tracked action, in observation order.
#[derive(Debug, Clone, Default)]
pub struct TrackedActivity {
    records: Vec<EnvelopeEvent>,
    pending: HashSet<EnvelopeId>,
}

impl TrackedActivity {
    fn record(&mut self, event: RuntimeEvent) {
        let RuntimeEvent::Envelope(event) = event else {
            return;
        };
        let id = event.envelope.id;
        match event.kind {
            EnvelopeEventKind::Completed | EnvelopeEventKind::DeadLettered => {
                self.pending.remove(&id);
            }
            EnvelopeEventKind::Sent
            | EnvelopeEventKind::Received
            | EnvelopeEventKind::Scheduled => {
                if !self.is_terminal(id) {
                    self.pending.insert(id);
                }
            }
        }
        self.records.push(event);
    }
    fn is_terminal(&self, id: EnvelopeId) -> bool {
        self.records.iter().any(|record| {
            record.envelope.id == id
                && matches!(
                    record.kind,
                    EnvelopeEventKind::Completed | EnvelopeEventKind::DeadLettered
                )
        })
    }
    fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }
    pub fn records_in_order(&self) -> &[EnvelopeEvent] {
        &self.records
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    fn history(&self, kind: EnvelopeEventKind) -> History<'_> {
        History(self.records.iter().filter(|r| r.kind == kind).collect())
    }
    pub fn sent(&self) -> History<'_> {
        self.history(EnvelopeEventKind::Sent)
    }
    pub fn received(&self) -> History<'_> {
        self.history(EnvelopeEventKind::Received)
    }
    pub fn completed(&self) -> History<'_> {
        self.history(EnvelopeEventKind::Completed)
    }
    pub fn scheduled(&self) -> History<'_> {
        self.history(EnvelopeEventKind::Scheduled)
    }
    pub fn dead_lettered(&self) -> History<'_> {
        self.history(EnvelopeEventKind::DeadLettered)
    }
    pub fn all(&self) -> History<'_> {
        History(self.records.iter().collect())
    }
}

/// An ordered selection of records.
#[derive(Debug, Clone)]
pub struct History<'a>(Vec<&'a EnvelopeEvent>);

impl<'a> History<'a> {
    pub fn of_type(&self, message_type: &MessageType) -> History<'a> {
        History(
            self.0
                .iter()
                .copied()
                .filter(|r| &r.envelope.message_type == message_type)
                .collect(),
        )
    }
    pub fn for_node(&self, node_id: NodeId) -> History<'a> {
        History(self.0.iter().copied().filter(|r| r.node_id == node_id).collect())
    }
    pub fn for_service(&self, service_name: &str) -> History<'a> {
        History(
            self.0
                .iter()
                .copied()
                .filter(|r| &*r.service_name == service_name)
                .collect(),
        )
    }
    /// Payloads of the records that decode as `M`.
    pub fn messages<M: Message>(&self) -> Vec<M> {
        self.0
            .iter()
            .filter(|r| r.envelope.message_type == M::MESSAGE_TYPE)
            .filter_map(|r| <M as MessageCodec>::from_bytes(r.envelope.payload().clone()))
            .collect()
    }
    pub fn records(&self) -> &[&'a EnvelopeEvent] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for History<'a> {
    type Item = &'a EnvelopeEvent;
    type IntoIter = std::vec::IntoIter<&'a EnvelopeEvent>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use courier::{
        bytes::Bytes,
        model::{Envelope, MessageType},
    };

    use super::*;

    fn event(kind: EnvelopeEventKind, envelope: &Envelope, node: u64) -> RuntimeEvent {
        RuntimeEvent::Envelope(EnvelopeEvent {
            kind,
            node_id: NodeId::new_indexed(node),
            service_name: Arc::from(if node == 1 { "Sender" } else { "Receiver" }),
            envelope: envelope.clone(),
            time: Utc::now(),
        })
    }

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::const_new("test/command"),
            Bytes::from_static(b"{}"),
            NodeId::new_indexed(2).control_address(),
        )
    }

    #[test]
    fn test_settles_on_terminal_events() {
        let a = envelope();
        let b = envelope();
        let mut activity = TrackedActivity::default();
        assert!(activity.is_settled());
        activity.record(event(EnvelopeEventKind::Sent, &a, 1));
        activity.record(event(EnvelopeEventKind::Sent, &b, 1));
        activity.record(event(EnvelopeEventKind::Received, &a, 2));
        activity.record(event(EnvelopeEventKind::Completed, &a, 2));
        assert!(!activity.is_settled());
        activity.record(event(EnvelopeEventKind::Scheduled, &b, 1));
        activity.record(event(EnvelopeEventKind::DeadLettered, &b, 1));
        assert!(activity.is_settled());
        // a late event of a settled envelope keeps it settled
        activity.record(event(EnvelopeEventKind::Received, &a, 2));
        assert!(activity.is_settled());
        assert_eq!(activity.len(), 7);
    }

    #[test]
    fn test_histories() {
        let a = envelope();
        let mut activity = TrackedActivity::default();
        activity.record(event(EnvelopeEventKind::Sent, &a, 1));
        activity.record(event(EnvelopeEventKind::Received, &a, 2));
        activity.record(event(EnvelopeEventKind::Completed, &a, 2));
        assert_eq!(activity.sent().len(), 1);
        assert_eq!(activity.received().for_node(NodeId::new_indexed(2)).len(), 1);
        assert!(activity.received().for_node(NodeId::new_indexed(1)).is_empty());
        assert_eq!(activity.all().for_service("Receiver").len(), 2);
        assert!(activity
            .completed()
            .of_type(&MessageType::const_new("test/other"))
            .is_empty());
        let kinds = activity
            .records_in_order()
            .iter()
            .map(|r| r.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                EnvelopeEventKind::Sent,
                EnvelopeEventKind::Received,
                EnvelopeEventKind::Completed
            ]
        );
    }
}
