//! Retry queue of local mutations not yet confirmed by the backend.
//!
//! Every local write becomes a [`PendingMutation`]. Per record the queue
//! holds at most one mutation in flight plus at most one queued behind it:
//! a write to a record whose mutation has not been sent yet is folded into
//! that mutation instead of adding a second one. Mutations for one record
//! are sent strictly in enqueue order; different records drain
//! independently.
//!
//! [`RetryQueue`] is the pure state machine and takes time as an argument.
//! [`MutationQueue`] wraps it for the engine: it is fed by the store as a
//! [`ChangeSink`], persists itself after every change and hands each write
//! its [`Confirmation`].

use crate::backend::{BackendError, ErrorClass};
use crate::clock::Clock;
use crate::conflict::{ConflictPolicy, MergeDecision};
use crate::persistence::Persistence;
use crate::store::{Change, ChangeKind, ChangeSink, WriteId, WriteOrigin};
use crate::{error::Result, CollectionName, Error, Record, RecordId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{futures::Notified, oneshot, Notify};
use uuid::Uuid;

pub type MutationId = Uuid;

/// What a pending mutation does on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    /// The operation left after `later` is folded into `self`.
    pub fn coalesce(self, later: MutationOp) -> MutationOp {
        match (self, later) {
            (_, MutationOp::Delete) => MutationOp::Delete,
            (MutationOp::Create, _) => MutationOp::Create,
            (_, later) => later,
        }
    }
}

impl From<ChangeKind> for MutationOp {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Create => MutationOp::Create,
            ChangeKind::Update => MutationOp::Update,
            ChangeKind::Delete => MutationOp::Delete,
        }
    }
}

/// Send state. Not persisted: after a restart everything is queued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationState {
    #[default]
    Queued,
    InFlight,
}

/// A durable record of a local write awaiting the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub op: MutationOp,
    pub collection: CollectionName,
    pub record_id: RecordId,
    /// Full record as written locally; sent as-is in the upsert
    pub payload: Record,
    /// Failed attempts so far
    pub attempts: u32,
    pub next_retry_at: Timestamp,
    pub enqueued_at: Timestamp,
    #[serde(skip, default)]
    pub state: MutationState,
}

impl PendingMutation {
    fn key(&self) -> (&str, &str) {
        (&self.collection, &self.record_id)
    }
}

/// Exponential retry delay: doubles from `base`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay(attempt).as_millis().min(u64::MAX as u128) as u64
    }
}

/// What happened to a mutation after a failed push.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Transient: back in the queue until `at`.
    Retry { attempts: u32, at: Timestamp },
    /// Permanent: removed from the queue.
    Dropped(PendingMutation),
    /// Authorization: kept, and the whole queue is paused.
    Paused,
}

/// Pure retry queue state machine.
#[derive(Debug, Clone, Default)]
pub struct RetryQueue {
    entries: Vec<PendingMutation>,
    backoff: Backoff,
    paused: bool,
}

impl RetryQueue {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            entries: Vec::new(),
            backoff,
            paused: false,
        }
    }

    /// Replace the contents with persisted mutations, all queued.
    pub fn restore(&mut self, mutations: Vec<PendingMutation>) {
        self.entries = mutations
            .into_iter()
            .map(|mut m| {
                m.state = MutationState::Queued;
                m
            })
            .collect();
    }

    /// Record a local write. Returns the id of the mutation that will carry
    /// it, which is an existing one when the write was coalesced.
    pub fn enqueue(
        &mut self,
        op: MutationOp,
        collection: &str,
        record: Record,
        now: Timestamp,
    ) -> MutationId {
        let tail = self
            .entries
            .iter_mut()
            .rev()
            .find(|m| m.key() == (collection, record.id.as_str()));

        if let Some(tail) = tail {
            if tail.state == MutationState::Queued {
                tail.op = tail.op.coalesce(op);
                tail.payload = record;
                return tail.id;
            }
        }

        let mutation = PendingMutation {
            id: Uuid::new_v4(),
            op,
            collection: collection.to_string(),
            record_id: record.id.clone(),
            payload: record,
            attempts: 0,
            next_retry_at: now,
            enqueued_at: now,
            state: MutationState::Queued,
        };
        let id = mutation.id;
        self.entries.push(mutation);
        id
    }

    /// Mark as in flight and return every mutation that may be sent now:
    /// the oldest mutation of each record, if it is queued and due.
    pub fn take_ready(&mut self, now: Timestamp) -> Vec<PendingMutation> {
        if self.paused {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut ready = Vec::new();
        for m in self.entries.iter_mut() {
            if !seen.insert((m.collection.clone(), m.record_id.clone())) {
                continue;
            }
            if m.state == MutationState::Queued && m.next_retry_at <= now {
                m.state = MutationState::InFlight;
                ready.push(m.clone());
            }
        }
        ready
    }

    /// Remove a mutation the backend accepted.
    pub fn confirm(&mut self, id: MutationId) -> Option<PendingMutation> {
        let index = self.entries.iter().position(|m| m.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Classify a failed push of mutation `id`.
    pub fn fail(
        &mut self,
        id: MutationId,
        error: &BackendError,
        now: Timestamp,
    ) -> Option<FailureOutcome> {
        let index = self.entries.iter().position(|m| m.id == id)?;

        match error.kind.class() {
            ErrorClass::Transient => {
                let m = &mut self.entries[index];
                m.attempts = m.attempts.saturating_add(1);
                m.next_retry_at = now.saturating_add(self.backoff.delay_ms(m.attempts));
                m.state = MutationState::Queued;
                Some(FailureOutcome::Retry {
                    attempts: m.attempts,
                    at: m.next_retry_at,
                })
            }
            ErrorClass::Authorization => {
                self.entries[index].state = MutationState::Queued;
                self.paused = true;
                Some(FailureOutcome::Paused)
            }
            ErrorClass::Permanent => Some(FailureOutcome::Dropped(self.entries.remove(index))),
        }
    }

    /// Drop queued mutations for a record that a newer remote version has
    /// overtaken. In-flight mutations are left to finish.
    pub fn supersede(
        &mut self,
        collection: &str,
        incoming: &Record,
        policy: ConflictPolicy,
    ) -> Vec<(MutationId, MergeDecision)> {
        let mut settled = Vec::new();
        self.entries.retain(|m| {
            if m.state != MutationState::Queued || m.key() != (collection, incoming.id.as_str()) {
                return true;
            }
            match policy.decide(Some(&m.payload), incoming) {
                MergeDecision::KeepLocal => true,
                decision => {
                    settled.push((m.id, decision));
                    false
                }
            }
        });
        settled
    }

    /// Lift an authorization pause.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Put every in-flight mutation back in the queue.
    pub fn release_in_flight(&mut self) {
        for m in self.entries.iter_mut() {
            m.state = MutationState::Queued;
        }
    }

    /// Earliest retry time among mutations that could be sent next.
    pub fn next_due(&self) -> Option<Timestamp> {
        if self.paused {
            return None;
        }
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|m| seen.insert(m.key()))
            .filter(|m| m.state == MutationState::Queued)
            .map(|m| m.next_retry_at)
            .min()
    }

    /// Whether a mutation of `collection` has failed at least once.
    pub fn has_retrying(&self, collection: &str) -> bool {
        self.entries
            .iter()
            .any(|m| m.collection == collection && m.attempts > 0)
    }

    /// All mutations, in enqueue order.
    pub fn snapshot(&self) -> Vec<PendingMutation> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Final outcome of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmed {
    /// The backend accepted the write.
    Acknowledged,
    /// A newer remote write won before this one was sent.
    Superseded,
}

type Waiter = oneshot::Sender<Result<Confirmed>>;

/// Resolves once the write it belongs to leaves the queue.
#[derive(Debug)]
pub struct Confirmation {
    rx: oneshot::Receiver<Result<Confirmed>>,
}

impl Confirmation {
    /// Wait for the outcome. A permanent rejection is `Error::Rejected`.
    pub async fn wait(self) -> Result<Confirmed> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Default)]
struct Inner {
    queue: RetryQueue,
    waiters: HashMap<MutationId, Vec<Waiter>>,
    expected: HashMap<WriteId, Waiter>,
}

impl Inner {
    fn settle(&mut self, id: MutationId, outcome: Result<Confirmed>) {
        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// The engine's retry queue.
pub struct MutationQueue {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    policy: ConflictPolicy,
    persistence: Option<Arc<Persistence>>,
    notify: Notify,
}

impl MutationQueue {
    pub fn new(
        backoff: Backoff,
        clock: Arc<dyn Clock>,
        policy: ConflictPolicy,
        persistence: Option<Arc<Persistence>>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: RetryQueue::new(backoff),
                ..Inner::default()
            }),
            clock,
            policy,
            persistence,
            notify: Notify::new(),
        }
    }

    /// Load mutations persisted by a previous session.
    pub fn restore(&self, mutations: Vec<PendingMutation>) {
        if mutations.is_empty() {
            return;
        }
        tracing::info!(pending = mutations.len(), "restored pending mutations");
        self.inner.lock().queue.restore(mutations);
        self.notify.notify_one();
    }

    /// Register interest in the outcome of the upcoming write `write_id`.
    ///
    /// Must be called before the write reaches the store. If the write
    /// fails validation, call [`MutationQueue::forget`].
    pub fn expect(&self, write_id: WriteId) -> Confirmation {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().expected.insert(write_id, tx);
        Confirmation { rx }
    }

    pub fn forget(&self, write_id: WriteId) {
        self.inner.lock().expected.remove(&write_id);
    }

    pub fn take_ready(&self) -> Vec<PendingMutation> {
        let now = self.clock.now();
        self.inner.lock().queue.take_ready(now)
    }

    pub fn confirm(&self, id: MutationId) {
        let mut inner = self.inner.lock();
        if inner.queue.confirm(id).is_some() {
            inner.settle(id, Ok(Confirmed::Acknowledged));
            self.persist(&inner);
        }
    }

    pub fn fail(&self, id: MutationId, error: &BackendError) -> Option<FailureOutcome> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let outcome = inner.queue.fail(id, error, now)?;
        if let FailureOutcome::Dropped(_) = &outcome {
            inner.settle(id, Err(Error::rejected(error)));
        }
        self.persist(&inner);
        Some(outcome)
    }

    pub fn resume(&self) {
        self.inner.lock().queue.resume();
        self.notify.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().queue.is_paused()
    }

    /// Requeue in-flight mutations and cancel every waiting caller.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock();
        inner.queue.release_in_flight();
        let ids: Vec<_> = inner.waiters.keys().copied().collect();
        for id in ids {
            inner.settle(id, Err(Error::SignedOut));
        }
        inner.expected.clear();
    }

    pub fn next_due(&self) -> Option<Timestamp> {
        self.inner.lock().queue.next_due()
    }

    pub fn has_retrying(&self, collection: &str) -> bool {
        self.inner.lock().queue.has_retrying(collection)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn snapshot(&self) -> Vec<PendingMutation> {
        self.inner.lock().queue.snapshot()
    }

    /// Completes after the next enqueue, resume or restore.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    fn persist(&self, inner: &Inner) {
        if let Some(persistence) = &self.persistence {
            persistence.persist_queue(inner.queue.snapshot());
        }
    }
}

impl ChangeSink for MutationQueue {
    fn on_change(&self, change: &Change) {
        let mut inner = self.inner.lock();
        match change.origin {
            WriteOrigin::Local => {
                let now = self.clock.now();
                let id = inner.queue.enqueue(
                    change.kind.into(),
                    &change.collection,
                    change.record.clone(),
                    now,
                );
                if let Some(waiter) = change.write_id.and_then(|w| inner.expected.remove(&w)) {
                    inner.waiters.entry(id).or_default().push(waiter);
                }
                tracing::debug!(
                    collection = %change.collection,
                    record_id = %change.record.id,
                    mutation_id = %id,
                    "queued local write"
                );
                self.persist(&inner);
                drop(inner);
                self.notify.notify_one();
            }
            WriteOrigin::Remote => {
                let settled = inner
                    .queue
                    .supersede(&change.collection, &change.record, self.policy);
                if settled.is_empty() {
                    return;
                }
                for (id, decision) in settled {
                    let outcome = match decision {
                        MergeDecision::Identical => Confirmed::Acknowledged,
                        _ => Confirmed::Superseded,
                    };
                    tracing::debug!(
                        collection = %change.collection,
                        record_id = %change.record.id,
                        mutation_id = %id,
                        ?outcome,
                        "pending write overtaken by remote version"
                    );
                    inner.settle(id, Ok(outcome));
                }
                self.persist(&inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendErrorKind;
    use serde_json::json;

    fn record(id: &str, updated_at: Timestamp, label: &str) -> Record {
        let mut r = Record::new(id, json!({"label": label}).as_object().cloned().unwrap(), 1);
        r.updated_at = updated_at;
        r
    }

    fn network() -> BackendError {
        BackendError::new(BackendErrorKind::Network, "offline")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (1..=8).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.delay(200), Duration::from_secs(30));
    }

    #[test]
    fn coalescing_folds_into_unsent_mutation() {
        let mut q = RetryQueue::default();
        let a = q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 10);
        let b = q.enqueue(MutationOp::Update, "tags", record("t-1", 11, "b"), 11);
        assert_eq!(a, b);
        assert_eq!(q.len(), 1);

        let m = &q.snapshot()[0];
        assert_eq!(m.op, MutationOp::Create);
        assert_eq!(m.payload.field("label"), Some(&json!("b")));
        assert_eq!(m.enqueued_at, 10);

        q.enqueue(MutationOp::Delete, "tags", record("t-1", 12, "b"), 12);
        assert_eq!(q.snapshot()[0].op, MutationOp::Delete);
    }

    #[test]
    fn one_in_flight_per_record() {
        let mut q = RetryQueue::default();
        q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 10);
        q.enqueue(MutationOp::Create, "tags", record("t-2", 10, "x"), 10);

        let ready = q.take_ready(10);
        assert_eq!(ready.len(), 2);

        // A write while the first is in flight queues behind it.
        let behind = q.enqueue(MutationOp::Update, "tags", record("t-1", 11, "b"), 11);
        assert_eq!(q.len(), 3);
        assert!(q.take_ready(100).is_empty());

        q.confirm(ready[0].id);
        let next = q.take_ready(100);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, behind);
    }

    #[test]
    fn transient_failures_back_off() {
        let mut q = RetryQueue::default();
        let id = q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 0);

        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..7 {
            assert_eq!(q.take_ready(now).len(), 1);
            match q.fail(id, &network(), now) {
                Some(FailureOutcome::Retry { at, .. }) => {
                    delays.push(at - now);
                    assert!(q.take_ready(at - 1).is_empty());
                    now = at;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert!(q.has_retrying("tags"));
    }

    #[test]
    fn permanent_failure_drops() {
        let mut q = RetryQueue::default();
        let id = q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 0);
        q.take_ready(0);

        let err = BackendError::new(BackendErrorKind::Constraint, "duplicate");
        assert!(matches!(q.fail(id, &err, 0), Some(FailureOutcome::Dropped(_))));
        assert!(q.is_empty());
    }

    #[test]
    fn authorization_failure_pauses() {
        let mut q = RetryQueue::default();
        let id = q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 0);
        q.take_ready(0);

        let err = BackendError::new(BackendErrorKind::Authorization, "expired");
        assert_eq!(q.fail(id, &err, 0), Some(FailureOutcome::Paused));
        assert_eq!(q.len(), 1);
        assert!(q.take_ready(1_000_000).is_empty());
        assert_eq!(q.next_due(), None);

        q.resume();
        assert_eq!(q.take_ready(0).len(), 1);
    }

    #[test]
    fn newer_remote_version_supersedes_queued_write() {
        let mut q = RetryQueue::default();
        q.enqueue(MutationOp::Update, "tags", record("t-1", 10, "mine"), 10);

        let older = record("t-1", 5, "old");
        assert!(q.supersede("tags", &older, ConflictPolicy::default()).is_empty());

        let newer = record("t-1", 20, "theirs");
        let settled = q.supersede("tags", &newer, ConflictPolicy::default());
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].1, MergeDecision::TakeIncoming);
        assert!(q.is_empty());
    }

    #[test]
    fn in_flight_is_never_superseded() {
        let mut q = RetryQueue::default();
        q.enqueue(MutationOp::Update, "tags", record("t-1", 10, "mine"), 10);
        q.take_ready(10);
        assert!(q
            .supersede("tags", &record("t-1", 20, "x"), ConflictPolicy::default())
            .is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn restore_requeues_everything() {
        let mut q = RetryQueue::default();
        q.enqueue(MutationOp::Create, "tags", record("t-1", 10, "a"), 0);
        q.take_ready(0);

        let json = serde_json::to_string(&q.snapshot()).unwrap();
        let mut restored = RetryQueue::default();
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.take_ready(0).len(), 1);
    }

    #[tokio::test]
    async fn confirmations_follow_the_mutation() {
        use crate::clock::ManualClock;
        use crate::store::Store;
        use crate::schema::{CollectionSchema, FieldDef, FieldType, Schema};

        let schema = Schema::new(1).with_collection(CollectionSchema::new(
            "tags",
            vec![FieldDef::required("label", FieldType::String)],
        ));
        let clock = Arc::new(ManualClock::new(100));
        let store = Store::new(schema, clock.clone(), ConflictPolicy::default());
        let queue = Arc::new(MutationQueue::new(
            Backoff::default(),
            clock,
            ConflictPolicy::default(),
            None,
        ));
        store.add_sink(queue.clone());

        let first_id = Uuid::new_v4();
        let first = queue.expect(first_id);
        store
            .set_tracked("tags", "t-1", json!({"label": "a"}), first_id)
            .unwrap();
        let second_id = Uuid::new_v4();
        let second = queue.expect(second_id);
        store
            .set_tracked("tags", "t-1", json!({"label": "b"}), second_id)
            .unwrap();

        let ready = queue.take_ready();
        assert_eq!(ready.len(), 1);
        queue.confirm(ready[0].id);

        assert_eq!(first.wait().await, Ok(Confirmed::Acknowledged));
        assert_eq!(second.wait().await, Ok(Confirmed::Acknowledged));
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejection_reaches_the_caller() {
        use crate::clock::ManualClock;

        let queue = MutationQueue::new(
            Backoff::default(),
            Arc::new(ManualClock::new(0)),
            ConflictPolicy::default(),
            None,
        );
        let write_id = Uuid::new_v4();
        let confirmation = queue.expect(write_id);
        queue.on_change(&Change {
            collection: "tags".into(),
            record: record("t-1", 1, "dup"),
            previous: None,
            kind: ChangeKind::Create,
            origin: WriteOrigin::Local,
            write_id: Some(write_id),
            version: 1,
        });

        let ready = queue.take_ready();
        let err = BackendError::new(BackendErrorKind::Constraint, "duplicate label");
        assert!(matches!(
            queue.fail(ready[0].id, &err),
            Some(FailureOutcome::Dropped(_))
        ));
        assert!(matches!(
            confirmation.wait().await,
            Err(Error::Rejected {
                kind: BackendErrorKind::Constraint,
                ..
            })
        ));
    }
}
