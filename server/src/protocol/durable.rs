pub mod memory;

use std::any::TypeId;
use std::{borrow::Cow, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Envelope, EnvelopeId, EnvelopeStatus, NodeId, NodeRecord};

pub use memory::MemoryDurable;

/// Which side of a node a persisted envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueKind {
    /// The outbox: written before a send, deleted once the transport took the frame.
    Outgoing,
    /// The inbox: written before a handler runs, kept after completion for duplicate detection.
    Incoming,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Outgoing => write!(f, "outgoing"),
            QueueKind::Incoming => write!(f, "incoming"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub queue: QueueKind,
    pub owner: NodeId,
    pub envelope: Envelope,
    pub dead_letter_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DurableRecord {
    pub fn new(queue: QueueKind, owner: NodeId, envelope: Envelope) -> Self {
        Self {
            queue,
            owner,
            envelope,
            dead_letter_reason: None,
            updated_at: Utc::now(),
        }
    }
    #[inline]
    pub fn status(&self) -> EnvelopeStatus {
        self.envelope.status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    /// A row with the same id already existed and was left untouched.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The row was not in the expected status; someone else already moved it.
    Stale,
}

#[derive(Debug)]
pub struct DurableError {
    pub context: Cow<'static, str>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for DurableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DurableError: {}", self.context)?;
        if let Some(source) = &self.source {
            write!(f, " with source: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for DurableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl DurableError {
    pub fn new_local(context: &'static str) -> Self {
        Self {
            context: context.into(),
            source: None,
        }
    }
    pub fn with_source(
        context: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
    pub fn not_found(queue: QueueKind, id: EnvelopeId) -> Self {
        Self {
            context: format!("{queue} record {id} not found").into(),
            source: None,
        }
    }
}

#[derive(Clone)]
pub struct DurableService {
    provider: Cow<'static, str>,
    provider_type: TypeId,
    inner: Arc<dyn sealed::DurabilityObjectTrait>,
}

impl std::fmt::Debug for DurableService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableService")
            .field("provider", &self.provider)
            .finish()
    }
}

impl DurableService {
    pub fn new<T>(inner: T) -> Self
    where
        T: Durable + 'static,
    {
        Self {
            provider: std::any::type_name::<T>().into(),
            provider_type: TypeId::of::<T>(),
            inner: Arc::new(inner),
        }
    }
    pub fn downcast_ref<T: Durable>(&self) -> Option<&T> {
        if self.provider_type == TypeId::of::<T>() {
            // SAFETY: the type id matches the concrete type stored in `inner`
            unsafe {
                Some(
                    &*(self.inner.as_ref() as *const dyn sealed::DurabilityObjectTrait as *const T),
                )
            }
        } else {
            None
        }
    }
    pub fn provider(&self) -> &str {
        &self.provider
    }
    #[inline(always)]
    pub async fn persist_outgoing(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> Result<PersistOutcome, DurableError> {
        self.inner.persist_outgoing(owner, envelope).await
    }
    #[inline(always)]
    pub async fn persist_incoming(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> Result<PersistOutcome, DurableError> {
        self.inner.persist_incoming(owner, envelope).await
    }
    #[inline(always)]
    pub async fn delete_outgoing(&self, id: EnvelopeId) -> Result<(), DurableError> {
        self.inner.delete_outgoing(id).await
    }
    #[inline(always)]
    pub async fn mark_complete(&self, id: EnvelopeId) -> Result<(), DurableError> {
        self.inner.mark_complete(id).await
    }
    #[inline(always)]
    pub async fn schedule_retry(
        &self,
        queue: QueueKind,
        owner: NodeId,
        envelope: Envelope,
        next_attempt_time: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        self.inner
            .schedule_retry(queue, owner, envelope, next_attempt_time)
            .await
    }
    #[inline(always)]
    pub async fn load_due(
        &self,
        owner: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DurableRecord>, DurableError> {
        self.inner.load_due(owner, now).await
    }
    #[inline(always)]
    pub async fn load_unsettled(&self, owner: NodeId) -> Result<Vec<DurableRecord>, DurableError> {
        self.inner.load_unsettled(owner).await
    }
    #[inline(always)]
    pub async fn purge_completed(&self, before: DateTime<Utc>) -> Result<usize, DurableError> {
        self.inner.purge_completed(before).await
    }
    #[inline(always)]
    pub async fn transition(
        &self,
        queue: QueueKind,
        envelope: Envelope,
        expected: EnvelopeStatus,
    ) -> Result<TransitionOutcome, DurableError> {
        self.inner.transition(queue, envelope, expected).await
    }
    #[inline(always)]
    pub async fn dead_letter(
        &self,
        queue: QueueKind,
        owner: NodeId,
        envelope: Envelope,
        reason: String,
    ) -> Result<(), DurableError> {
        self.inner.dead_letter(queue, owner, envelope, reason).await
    }
    #[inline(always)]
    pub async fn retrieve(
        &self,
        queue: QueueKind,
        id: EnvelopeId,
    ) -> Result<Option<DurableRecord>, DurableError> {
        self.inner.retrieve(queue, id).await
    }
    #[inline(always)]
    pub async fn dead_letters(&self) -> Result<Vec<DurableRecord>, DurableError> {
        self.inner.dead_letters().await
    }
    #[inline(always)]
    pub async fn register_node(&self, record: NodeRecord) -> Result<(), DurableError> {
        self.inner.register_node(record).await
    }
    #[inline(always)]
    pub async fn heartbeat(&self, node: NodeId, time: DateTime<Utc>) -> Result<(), DurableError> {
        self.inner.heartbeat(node, time).await
    }
    #[inline(always)]
    pub async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError> {
        self.inner.unregister_node(node).await
    }
    #[inline(always)]
    pub async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError> {
        self.inner.nodes().await
    }
}

/// Persistent storage of envelopes and of the node registry.
///
/// Every operation is atomic on its own. Implementations lock per envelope, never the whole
/// store, and must survive a restart of the runtimes that use them.
pub trait Durable: Send + Sync + 'static {
    /// Write an envelope to the outbox before it is handed to a transport.
    ///
    /// Persisting the same id twice leaves the first row in place and reports
    /// [`PersistOutcome::Duplicate`].
    fn persist_outgoing(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> impl Future<Output = Result<PersistOutcome, DurableError>> + Send;
    /// Write an inbound envelope to the inbox before any handler sees it.
    fn persist_incoming(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> impl Future<Output = Result<PersistOutcome, DurableError>> + Send;
    fn delete_outgoing(
        &self,
        id: EnvelopeId,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
    /// Move an inbox row to `Completed`; the row is kept.
    fn mark_complete(&self, id: EnvelopeId)
        -> impl Future<Output = Result<(), DurableError>> + Send;
    /// Upsert the row as `Scheduled` at `next_attempt_time`.
    fn schedule_retry(
        &self,
        queue: QueueKind,
        owner: NodeId,
        envelope: Envelope,
        next_attempt_time: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
    /// `Scheduled` rows of `owner` that are due at `now`, ordered by `(scheduled_time, id)`.
    fn load_due(
        &self,
        owner: NodeId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<DurableRecord>, DurableError>> + Send;
    /// Rows of `owner` left in `Created`, `Sent` or `Received`, that is rows whose delivery
    /// was interrupted.
    fn load_unsettled(
        &self,
        owner: NodeId,
    ) -> impl Future<Output = Result<Vec<DurableRecord>, DurableError>> + Send;
    /// Drop `Completed` inbox rows last updated before `before`, returning how many went.
    fn purge_completed(
        &self,
        before: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, DurableError>> + Send;
    /// Replace the row with `envelope` if and only if the row is currently in `expected`.
    fn transition(
        &self,
        queue: QueueKind,
        envelope: Envelope,
        expected: EnvelopeStatus,
    ) -> impl Future<Output = Result<TransitionOutcome, DurableError>> + Send;
    fn dead_letter(
        &self,
        queue: QueueKind,
        owner: NodeId,
        envelope: Envelope,
        reason: String,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
    fn retrieve(
        &self,
        queue: QueueKind,
        id: EnvelopeId,
    ) -> impl Future<Output = Result<Option<DurableRecord>, DurableError>> + Send;
    fn dead_letters(&self) -> impl Future<Output = Result<Vec<DurableRecord>, DurableError>> + Send;
    fn register_node(
        &self,
        record: NodeRecord,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
    fn heartbeat(
        &self,
        node: NodeId,
        time: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), DurableError>> + Send;
    fn unregister_node(&self, node: NodeId)
        -> impl Future<Output = Result<(), DurableError>> + Send;
    fn nodes(&self) -> impl Future<Output = Result<Vec<NodeRecord>, DurableError>> + Send;
}

mod sealed {
    use std::{future::Future, pin::Pin};

    use chrono::{DateTime, Utc};

    use crate::model::{Envelope, EnvelopeId, EnvelopeStatus, NodeId, NodeRecord};

    use super::{
        Durable, DurableError, DurableRecord, PersistOutcome, QueueKind, TransitionOutcome,
    };

    type BoxedResult<'a, T> = Pin<Box<dyn Future<Output = Result<T, DurableError>> + Send + 'a>>;

    pub(super) trait DurabilityObjectTrait: Send + Sync + 'static {
        fn persist_outgoing(&self, owner: NodeId, envelope: Envelope)
            -> BoxedResult<'_, PersistOutcome>;
        fn persist_incoming(&self, owner: NodeId, envelope: Envelope)
            -> BoxedResult<'_, PersistOutcome>;
        fn delete_outgoing(&self, id: EnvelopeId) -> BoxedResult<'_, ()>;
        fn mark_complete(&self, id: EnvelopeId) -> BoxedResult<'_, ()>;
        fn schedule_retry(
            &self,
            queue: QueueKind,
            owner: NodeId,
            envelope: Envelope,
            next_attempt_time: DateTime<Utc>,
        ) -> BoxedResult<'_, ()>;
        fn load_due(&self, owner: NodeId, now: DateTime<Utc>)
            -> BoxedResult<'_, Vec<DurableRecord>>;
        fn load_unsettled(&self, owner: NodeId) -> BoxedResult<'_, Vec<DurableRecord>>;
        fn purge_completed(&self, before: DateTime<Utc>) -> BoxedResult<'_, usize>;
        fn transition(
            &self,
            queue: QueueKind,
            envelope: Envelope,
            expected: EnvelopeStatus,
        ) -> BoxedResult<'_, TransitionOutcome>;
        fn dead_letter(
            &self,
            queue: QueueKind,
            owner: NodeId,
            envelope: Envelope,
            reason: String,
        ) -> BoxedResult<'_, ()>;
        fn retrieve(&self, queue: QueueKind, id: EnvelopeId)
            -> BoxedResult<'_, Option<DurableRecord>>;
        fn dead_letters(&self) -> BoxedResult<'_, Vec<DurableRecord>>;
        fn register_node(&self, record: NodeRecord) -> BoxedResult<'_, ()>;
        fn heartbeat(&self, node: NodeId, time: DateTime<Utc>) -> BoxedResult<'_, ()>;
        fn unregister_node(&self, node: NodeId) -> BoxedResult<'_, ()>;
        fn nodes(&self) -> BoxedResult<'_, Vec<NodeRecord>>;
    }

    impl<T> DurabilityObjectTrait for T
    where
        T: Durable,
    {
        #[inline(always)]
        fn persist_outgoing(
            &self,
            owner: NodeId,
            envelope: Envelope,
        ) -> BoxedResult<'_, PersistOutcome> {
            Box::pin(Durable::persist_outgoing(self, owner, envelope))
        }
        #[inline(always)]
        fn persist_incoming(
            &self,
            owner: NodeId,
            envelope: Envelope,
        ) -> BoxedResult<'_, PersistOutcome> {
            Box::pin(Durable::persist_incoming(self, owner, envelope))
        }
        #[inline(always)]
        fn delete_outgoing(&self, id: EnvelopeId) -> BoxedResult<'_, ()> {
            Box::pin(Durable::delete_outgoing(self, id))
        }
        #[inline(always)]
        fn mark_complete(&self, id: EnvelopeId) -> BoxedResult<'_, ()> {
            Box::pin(Durable::mark_complete(self, id))
        }
        #[inline(always)]
        fn schedule_retry(
            &self,
            queue: QueueKind,
            owner: NodeId,
            envelope: Envelope,
            next_attempt_time: DateTime<Utc>,
        ) -> BoxedResult<'_, ()> {
            Box::pin(Durable::schedule_retry(
                self,
                queue,
                owner,
                envelope,
                next_attempt_time,
            ))
        }
        #[inline(always)]
        fn load_due(&self, owner: NodeId, now: DateTime<Utc>) -> BoxedResult<'_, Vec<DurableRecord>> {
            Box::pin(Durable::load_due(self, owner, now))
        }
        #[inline(always)]
        fn load_unsettled(&self, owner: NodeId) -> BoxedResult<'_, Vec<DurableRecord>> {
            Box::pin(Durable::load_unsettled(self, owner))
        }
        #[inline(always)]
        fn purge_completed(&self, before: DateTime<Utc>) -> BoxedResult<'_, usize> {
            Box::pin(Durable::purge_completed(self, before))
        }
        #[inline(always)]
        fn transition(
            &self,
            queue: QueueKind,
            envelope: Envelope,
            expected: EnvelopeStatus,
        ) -> BoxedResult<'_, TransitionOutcome> {
            Box::pin(Durable::transition(self, queue, envelope, expected))
        }
        #[inline(always)]
        fn dead_letter(
            &self,
            queue: QueueKind,
            owner: NodeId,
            envelope: Envelope,
            reason: String,
        ) -> BoxedResult<'_, ()> {
            Box::pin(Durable::dead_letter(self, queue, owner, envelope, reason))
        }
        #[inline(always)]
        fn retrieve(
            &self,
            queue: QueueKind,
            id: EnvelopeId,
        ) -> BoxedResult<'_, Option<DurableRecord>> {
            Box::pin(Durable::retrieve(self, queue, id))
        }
        #[inline(always)]
        fn dead_letters(&self) -> BoxedResult<'_, Vec<DurableRecord>> {
            Box::pin(Durable::dead_letters(self))
        }
        #[inline(always)]
        fn register_node(&self, record: NodeRecord) -> BoxedResult<'_, ()> {
            Box::pin(Durable::register_node(self, record))
        }
        #[inline(always)]
        fn heartbeat(&self, node: NodeId, time: DateTime<Utc>) -> BoxedResult<'_, ()> {
            Box::pin(Durable::heartbeat(self, node, time))
        }
        #[inline(always)]
        fn unregister_node(&self, node: NodeId) -> BoxedResult<'_, ()> {
            Box::pin(Durable::unregister_node(self, node))
        }
        #[inline(always)]
        fn nodes(&self) -> BoxedResult<'_, Vec<NodeRecord>> {
            Box::pin(Durable::nodes(self))
        }
    }
}
