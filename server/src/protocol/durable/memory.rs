use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::model::{Envelope, EnvelopeId, EnvelopeStatus, NodeId, NodeRecord};

use super::{
    Durable, DurableError, DurableRecord, PersistOutcome, QueueKind, TransitionOutcome,
};

type RecordKey = (QueueKind, EnvelopeId);

/// In-process reference store.
///
/// The record map lock is only held to find a row, each row carries its own lock. Clone the
/// [`DurableService`](super::DurableService) wrapping it to share one store between runtimes, a
/// runtime that restarts on the same store picks up where the previous one stopped.
#[derive(Debug, Default)]
pub struct MemoryDurable {
    records: RwLock<HashMap<RecordKey, Arc<Mutex<DurableRecord>>>>,
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
    failing_writes: AtomicU32,
}

impl MemoryDurable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Make the next `count` write operations fail with a [`DurableError`].
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }
    fn check_write(&self) -> Result<(), DurableError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            Err(DurableError::new_local("injected write failure"))
        } else {
            Ok(())
        }
    }
    async fn row(&self, key: RecordKey) -> Option<Arc<Mutex<DurableRecord>>> {
        self.records.read().await.get(&key).cloned()
    }
    async fn insert_if_absent(&self, record: DurableRecord) -> PersistOutcome {
        let key = (record.queue, record.envelope.id);
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return PersistOutcome::Duplicate;
        }
        records.insert(key, Arc::new(Mutex::new(record)));
        PersistOutcome::Inserted
    }
    async fn upsert(
        &self,
        queue: QueueKind,
        owner: NodeId,
        envelope: Envelope,
        reason: Option<String>,
    ) {
        let key = (queue, envelope.id);
        let existed = self.row(key).await;
        let row = match existed {
            Some(row) => row,
            None => self
                .records
                .write()
                .await
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(DurableRecord::new(queue, owner, envelope.clone())))
                })
                .clone(),
        };
        let mut record = row.lock().await;
        record.owner = owner;
        record.envelope = envelope;
        record.dead_letter_reason = reason;
        record.updated_at = Utc::now();
    }
    /// Number of rows in `queue`, whatever their status.
    pub async fn len(&self, queue: QueueKind) -> usize {
        self.records
            .read()
            .await
            .keys()
            .filter(|(q, _)| *q == queue)
            .count()
    }
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Durable for MemoryDurable {
    async fn persist_outgoing(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> Result<PersistOutcome, DurableError> {
        self.check_write()?;
        Ok(self
            .insert_if_absent(DurableRecord::new(QueueKind::Outgoing, owner, envelope))
            .await)
    }

    async fn persist_incoming(
        &self,
        owner: NodeId,
        envelope: Envelope,
    ) -> Result<PersistOutcome, DurableError> {
        self.check_write()?;
        Ok(self
            .insert_if_absent(DurableRecord::new(QueueKind::Incoming, owner, envelope))
            .await)
    }

    async fn delete_outgoing(&self, id: EnvelopeId) -> Result<(), DurableError> {
        self.check_write()?;
        self.records.write().await.remove(&(QueueKind::Outgoing, id));
        Ok(())
    }

    async fn mark_complete(&self, id: EnvelopeId) -> Result<(), DurableError> {
        self.check_write()?;
        let row = self
            .row((QueueKind::Incoming, id))
            .await
            .ok_or_else(|| DurableError::not_found(QueueKind::Incoming, id))?;
        let mut record = row.lock().await;
        match record.envelope.status {
            EnvelopeStatus::Completed => Ok(()),
            status if status.can_transition_to(EnvelopeStatus::Completed) => {
                record.envelope.status = EnvelopeStatus::Completed;
                record.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(DurableError::new_local(
                "record cannot be completed from its current status",
            )),
        }
    }

    async fn schedule_retry(
        &self,
        queue: QueueKind,
        owner: NodeId,
        mut envelope: Envelope,
        next_attempt_time: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        self.check_write()?;
        envelope.status = EnvelopeStatus::Scheduled;
        envelope.scheduled_time = Some(next_attempt_time);
        self.upsert(queue, owner, envelope, None).await;
        Ok(())
    }

    async fn load_due(
        &self,
        owner: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DurableRecord>, DurableError> {
        let rows = self
            .records
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut due = Vec::new();
        for row in rows {
            let record = row.lock().await;
            if record.owner == owner
                && record.envelope.status == EnvelopeStatus::Scheduled
                && record.envelope.is_due(now)
            {
                due.push(record.clone());
            }
        }
        due.sort_by_key(|record| (record.envelope.scheduled_time, record.envelope.id));
        Ok(due)
    }

    async fn load_unsettled(&self, owner: NodeId) -> Result<Vec<DurableRecord>, DurableError> {
        let rows = self
            .records
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut unsettled = Vec::new();
        for row in rows {
            let record = row.lock().await;
            if record.owner == owner
                && matches!(
                    record.envelope.status,
                    EnvelopeStatus::Created | EnvelopeStatus::Sent | EnvelopeStatus::Received
                )
            {
                unsettled.push(record.clone());
            }
        }
        unsettled.sort_by_key(|record| (record.updated_at, record.envelope.id));
        Ok(unsettled)
    }

    async fn purge_completed(&self, before: DateTime<Utc>) -> Result<usize, DurableError> {
        self.check_write()?;
        let mut records = self.records.write().await;
        let mut expired = Vec::new();
        for (key, row) in records.iter() {
            // a locked row is being worked on, it is not stale
            let Ok(record) = row.try_lock() else {
                continue;
            };
            if record.queue == QueueKind::Incoming
                && record.envelope.status == EnvelopeStatus::Completed
                && record.updated_at < before
            {
                expired.push(*key);
            }
        }
        for key in &expired {
            records.remove(key);
        }
        Ok(expired.len())
    }

    async fn transition(
        &self,
        queue: QueueKind,
        envelope: Envelope,
        expected: EnvelopeStatus,
    ) -> Result<TransitionOutcome, DurableError> {
        self.check_write()?;
        let Some(row) = self.row((queue, envelope.id)).await else {
            return Ok(TransitionOutcome::Stale);
        };
        let mut record = row.lock().await;
        if record.envelope.status != expected {
            return Ok(TransitionOutcome::Stale);
        }
        record.envelope = envelope;
        record.updated_at = Utc::now();
        Ok(TransitionOutcome::Applied)
    }

    async fn dead_letter(
        &self,
        queue: QueueKind,
        owner: NodeId,
        mut envelope: Envelope,
        reason: String,
    ) -> Result<(), DurableError> {
        self.check_write()?;
        envelope.status = EnvelopeStatus::DeadLettered;
        envelope.dead_letter_reason = Some(reason.clone());
        self.upsert(queue, owner, envelope, Some(reason)).await;
        Ok(())
    }

    async fn retrieve(
        &self,
        queue: QueueKind,
        id: EnvelopeId,
    ) -> Result<Option<DurableRecord>, DurableError> {
        let Some(row) = self.row((queue, id)).await else {
            return Ok(None);
        };
        let record = row.lock().await.clone();
        Ok(Some(record))
    }

    async fn dead_letters(&self) -> Result<Vec<DurableRecord>, DurableError> {
        let rows = self
            .records
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut dead = Vec::new();
        for row in rows {
            let record = row.lock().await;
            if record.envelope.status == EnvelopeStatus::DeadLettered {
                dead.push(record.clone());
            }
        }
        dead.sort_by_key(|record| (record.updated_at, record.envelope.id));
        Ok(dead)
    }

    async fn register_node(&self, record: NodeRecord) -> Result<(), DurableError> {
        self.check_write()?;
        self.nodes.write().await.insert(record.node_id, record);
        Ok(())
    }

    async fn heartbeat(&self, node: NodeId, time: DateTime<Utc>) -> Result<(), DurableError> {
        self.check_write()?;
        if let Some(record) = self.nodes.write().await.get_mut(&node) {
            record.last_heartbeat = record.last_heartbeat.max(time);
        }
        Ok(())
    }

    async fn unregister_node(&self, node: NodeId) -> Result<(), DurableError> {
        self.check_write()?;
        self.nodes.write().await.remove(&node);
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<NodeRecord>, DurableError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::model::MessageType;

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::const_new("Command"),
            Bytes::from_static(b"10"),
            NodeId::new_indexed(2).control_address(),
        )
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let store = MemoryDurable::new();
        let owner = NodeId::new_indexed(1);
        let e = envelope();
        assert_eq!(
            store.persist_outgoing(owner, e.clone()).await.unwrap(),
            PersistOutcome::Inserted
        );
        let mut changed = e.clone();
        changed.attempts = 7;
        assert_eq!(
            store.persist_outgoing(owner, changed).await.unwrap(),
            PersistOutcome::Duplicate
        );
        let stored = store
            .retrieve(QueueKind::Outgoing, e.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.envelope, e);
        assert_eq!(store.len(QueueKind::Outgoing).await, 1);
        // the same id may live in both queues
        assert_eq!(
            store.persist_incoming(owner, e.clone()).await.unwrap(),
            PersistOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_load_due_order_and_owner() {
        let store = MemoryDurable::new();
        let owner = NodeId::new_indexed(1);
        let other = NodeId::new_indexed(2);
        let now = Utc::now();
        let at = |ms: i64| now - chrono::Duration::milliseconds(ms);
        let mut expected = Vec::new();
        for (ms, who) in [(10, owner), (30, owner), (20, owner), (30, owner), (40, other)] {
            let e = envelope();
            store
                .schedule_retry(QueueKind::Incoming, who, e.clone(), at(ms))
                .await
                .unwrap();
            if who == owner {
                expected.push((at(ms), e.id));
            }
        }
        let late = envelope();
        store
            .schedule_retry(
                QueueKind::Outgoing,
                owner,
                late.clone(),
                now + chrono::Duration::seconds(60),
            )
            .await
            .unwrap();
        expected.sort();
        let due = store.load_due(owner, now).await.unwrap();
        let got = due
            .iter()
            .map(|r| (r.envelope.scheduled_time.unwrap(), r.envelope.id))
            .collect::<Vec<_>>();
        assert_eq!(got, expected);
        assert!(due.iter().all(|r| r.envelope.status == EnvelopeStatus::Scheduled));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = Arc::new(MemoryDurable::new());
        let owner = NodeId::new_indexed(1);
        let mut e = envelope();
        e.mark_sent().unwrap();
        e.mark_received().unwrap();
        e.record_attempt();
        store
            .schedule_retry(QueueKind::Incoming, owner, e.clone(), Utc::now())
            .await
            .unwrap();
        e.mark_scheduled(Utc::now()).unwrap();
        let mut claimed = e.clone();
        claimed.mark_received().unwrap();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            let claimed = claimed.clone();
            tasks.spawn(async move {
                store
                    .transition(QueueKind::Incoming, claimed, EnvelopeStatus::Scheduled)
                    .await
                    .unwrap()
            });
        }
        let mut applied = 0;
        while let Some(outcome) = tasks.join_next().await {
            if outcome.unwrap() == TransitionOutcome::Applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        store.mark_complete(e.id).await.unwrap();
        let record = store
            .retrieve(QueueKind::Incoming, e.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status(), EnvelopeStatus::Completed);
    }

    #[tokio::test]
    async fn test_dead_letter_is_retained() {
        let store = MemoryDurable::new();
        let owner = NodeId::new_indexed(1);
        let e = envelope();
        store.persist_incoming(owner, e.clone()).await.unwrap();
        store
            .dead_letter(QueueKind::Incoming, owner, e.clone(), "poison".into())
            .await
            .unwrap();
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("poison"));
        assert!(store.load_due(owner, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_unsettled() {
        let store = MemoryDurable::new();
        let owner = NodeId::new_indexed(1);
        let created = envelope();
        store.persist_outgoing(owner, created.clone()).await.unwrap();
        let mut received = envelope();
        received.mark_sent().unwrap();
        received.mark_received().unwrap();
        store.persist_incoming(owner, received.clone()).await.unwrap();
        let mut scheduled = envelope();
        scheduled.mark_scheduled(Utc::now()).unwrap();
        store.persist_outgoing(owner, scheduled).await.unwrap();
        let mut completed = received.clone();
        completed.id = EnvelopeId::new_snowflake();
        store.persist_incoming(owner, completed.clone()).await.unwrap();
        store.mark_complete(completed.id).await.unwrap();
        store
            .persist_outgoing(NodeId::new_indexed(2), envelope())
            .await
            .unwrap();

        let mut ids = store
            .load_unsettled(owner)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.envelope.id)
            .collect::<Vec<_>>();
        ids.sort();
        let mut expected = vec![created.id, received.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_purge_completed() {
        let store = MemoryDurable::new();
        let owner = NodeId::new_indexed(1);
        let mut old = envelope();
        old.mark_sent().unwrap();
        old.mark_received().unwrap();
        store.persist_incoming(owner, old.clone()).await.unwrap();
        store.mark_complete(old.id).await.unwrap();
        let mut pending = envelope();
        pending.mark_sent().unwrap();
        pending.mark_received().unwrap();
        store.persist_incoming(owner, pending.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut fresh = envelope();
        fresh.mark_sent().unwrap();
        fresh.mark_received().unwrap();
        store.persist_incoming(owner, fresh.clone()).await.unwrap();
        store.mark_complete(fresh.id).await.unwrap();

        assert_eq!(store.purge_completed(cutoff).await.unwrap(), 1);
        assert!(store
            .retrieve(QueueKind::Incoming, old.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .retrieve(QueueKind::Incoming, pending.id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .retrieve(QueueKind::Incoming, fresh.id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.purge_completed(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryDurable::new();
        store.fail_next_writes(2);
        let owner = NodeId::new_indexed(1);
        assert!(store.persist_outgoing(owner, envelope()).await.is_err());
        assert!(store.persist_outgoing(owner, envelope()).await.is_err());
        assert!(store.persist_outgoing(owner, envelope()).await.is_ok());
    }

    #[tokio::test]
    async fn test_node_registry() {
        let store = MemoryDurable::new();
        let id = NodeId::new_indexed(5);
        let record = NodeRecord::new(id, "Receiver");
        let started = record.last_heartbeat;
        store.register_node(record).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.heartbeat(id, Utc::now()).await.unwrap();
        let nodes = store.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].last_heartbeat > started);
        store.unregister_node(id).await.unwrap();
        assert!(store.nodes().await.unwrap().is_empty());
    }
}
