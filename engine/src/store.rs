//! Store - the in-memory, observable state container.
//!
//! The Store holds every synced collection and is the only read/write surface
//! for the rest of the app. Writes are synchronous: state is updated under a
//! lock, the lock is released, and then change sinks (retry queue,
//! persistence) and subscribers are called in that order, all before `set`
//! returns. A writer lock is held across apply and dispatch so two writers
//! never interleave their notifications. It is reentrant, which lets a
//! subscriber write back into the store from its callback; subscribers see
//! such a write only after every one of them has seen the current change.

use crate::clock::{next_write_stamp, Clock};
use crate::conflict::{ConflictPolicy, MergeDecision};
use crate::record::into_fields;
use crate::{error::Result, CollectionName, Error, Record, RecordId, Schema};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Identifier of a single local write, used to claim its confirmation.
pub type WriteId = Uuid;

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Issued by the app on this device
    Local,
    /// Merged in from the backend (pull, live feed, push acknowledgment)
    Remote,
}

/// What a write did to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A committed change, delivered to sinks and subscribers.
#[derive(Debug, Clone)]
pub struct Change {
    pub collection: CollectionName,
    /// The record after the write
    pub record: Record,
    /// The record before the write, if it existed
    pub previous: Option<Record>,
    pub kind: ChangeKind,
    pub origin: WriteOrigin,
    /// Set for local writes only
    pub write_id: Option<WriteId>,
    /// Collection version after the write
    pub version: u64,
}

/// Receives every committed change before subscribers do.
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, change: &Change);
}

/// What a subscriber listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Collection(CollectionName),
    Record(CollectionName, RecordId),
}

impl Topic {
    fn matches(&self, change: &Change) -> bool {
        match self {
            Topic::Collection(name) => *name == change.collection,
            Topic::Record(name, id) => *name == change.collection && *id == change.record.id,
        }
    }
}

type Callback = Arc<dyn Fn(&Change) + Send + Sync>;

struct Subscriber {
    id: u64,
    topics: Vec<Topic>,
    callback: Callback,
}

/// Handle returned by [`Store::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the subscription. Safe after the store is gone.
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.lock().retain(|s| s.id != self.id);
        }
    }
}

/// Result of a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub record: Record,
    pub write_id: WriteId,
}

/// A collection of records with a change counter.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: HashMap<RecordId, Record>,
    version: u64,
}

impl Collection {
    /// Get a record by ID, including tombstones.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    /// Get all active (non-deleted) records.
    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active_records().count()
    }

    /// Check if collection has no active records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&mut self, record: Record) -> u64 {
        self.records.insert(record.id.clone(), record);
        self.version += 1;
        self.version
    }
}

struct Shared {
    schema: Schema,
    clock: Arc<dyn Clock>,
    policy: ConflictPolicy,
    collections: RwLock<HashMap<CollectionName, Collection>>,
    writer: ReentrantMutex<()>,
    sinks: RwLock<Vec<Arc<dyn ChangeSink>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    /// Changes committed from inside a callback, waiting for their round
    outbox: Mutex<VecDeque<Change>>,
    delivering: AtomicBool,
}

/// The shared, observable store. Cloning shares the same state.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("collections", &self.shared.schema.collection_names())
            .finish()
    }
}

impl Store {
    /// Create an empty store with one collection per schema entry.
    pub fn new(schema: Schema, clock: Arc<dyn Clock>, policy: ConflictPolicy) -> Self {
        let collections = schema
            .collections
            .keys()
            .map(|name| (name.clone(), Collection::default()))
            .collect();

        Self {
            shared: Arc::new(Shared {
                schema,
                clock,
                policy,
                collections: RwLock::new(collections),
                writer: ReentrantMutex::new(()),
                sinks: RwLock::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                outbox: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
            }),
        }
    }

    /// Get the schema.
    pub fn schema(&self) -> &Schema {
        &self.shared.schema
    }

    /// Get the merge policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.shared.policy
    }

    /// Load persisted records without notifying anyone or queuing anything.
    ///
    /// Only meant for boot, before sinks are attached and sync starts.
    pub fn hydrate(&self, loaded: BTreeMap<CollectionName, BTreeMap<RecordId, Record>>) {
        let mut collections = self.shared.collections.write();
        for (name, records) in loaded {
            if let Some(collection) = collections.get_mut(&name) {
                collection.records.extend(records);
                collection.version += 1;
            }
        }
    }

    /// Attach a sink that sees every committed change.
    pub fn add_sink(&self, sink: Arc<dyn ChangeSink>) {
        self.shared.sinks.write().push(sink);
    }

    /// Get an active record by collection and ID.
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        self.get_including_deleted(collection, id)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones.
    pub fn get_including_deleted(&self, collection: &str, id: &str) -> Option<Record> {
        self.shared
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned()
    }

    /// All active records of a collection, keyed by id.
    pub fn get_all(&self, collection: &str) -> Result<HashMap<RecordId, Record>> {
        let collections = self.shared.collections.read();
        let c = collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(c
            .active_records()
            .map(|r| (r.id.clone(), r.clone()))
            .collect())
    }

    /// Active records whose fields satisfy `predicate`.
    pub fn filter<F>(&self, collection: &str, predicate: F) -> Result<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let collections = self.shared.collections.read();
        let c = collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(c.active_records().filter(|r| predicate(r)).cloned().collect())
    }

    /// Every record including tombstones, in id order.
    pub fn snapshot(&self, collection: &str) -> Result<BTreeMap<RecordId, Record>> {
        let collections = self.shared.collections.read();
        let c = collections
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(c.records
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect())
    }

    /// Change counter of a collection. Bumped on every committed write.
    pub fn version(&self, collection: &str) -> u64 {
        self.shared
            .collections
            .read()
            .get(collection)
            .map(|c| c.version)
            .unwrap_or(0)
    }

    fn versions(&self, names: &[CollectionName]) -> Vec<u64> {
        let collections = self.shared.collections.read();
        names
            .iter()
            .map(|n| collections.get(n).map(|c| c.version).unwrap_or(0))
            .collect()
    }

    /// Create a record with a freshly minted client id.
    pub fn insert(&self, collection: &str, fields: Value) -> Result<WriteReceipt> {
        let id = crate::identity::new_record_id();
        self.set(collection, &id, fields)
    }

    /// Create or patch a record. The patch is shallow-merged into the fields.
    pub fn set(&self, collection: &str, id: &str, patch: Value) -> Result<WriteReceipt> {
        self.set_tracked(collection, id, patch, Uuid::new_v4())
    }

    /// [`Store::set`] under a caller-chosen write id.
    pub fn set_tracked(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
        write_id: WriteId,
    ) -> Result<WriteReceipt> {
        let patch = into_fields(patch)?;
        let schema = self.shared.schema.get_collection(collection)?;
        schema.check_patch(&patch)?;

        let _writer = self.shared.writer.lock();
        let change = {
            let mut collections = self.shared.collections.write();
            let c = collections
                .get_mut(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            let now = self.shared.clock.now();
            let previous = c.get(id).cloned();

            let (record, kind) = match &previous {
                Some(prev) if prev.deleted => return Err(Error::OperationOnDeleted(id.into())),
                Some(prev) => {
                    let mut next = prev.clone();
                    next.apply_patch(&patch, next_write_stamp(now, Some(prev.updated_at)));
                    schema.validate_fields(&next.fields)?;
                    (next, ChangeKind::Update)
                }
                None => {
                    let record = Record::new(id, patch, now);
                    schema.validate_fields(&record.fields)?;
                    (record, ChangeKind::Create)
                }
            };

            let version = c.put(record.clone());
            Change {
                collection: collection.to_string(),
                record,
                previous,
                kind,
                origin: WriteOrigin::Local,
                write_id: Some(write_id),
                version,
            }
        };

        self.dispatch(&change);
        Ok(WriteReceipt {
            write_id,
            record: change.record,
        })
    }

    /// Soft-delete a record by setting its tombstone.
    pub fn delete(&self, collection: &str, id: &str) -> Result<WriteReceipt> {
        self.delete_tracked(collection, id, Uuid::new_v4())
    }

    /// [`Store::delete`] under a caller-chosen write id.
    pub fn delete_tracked(
        &self,
        collection: &str,
        id: &str,
        write_id: WriteId,
    ) -> Result<WriteReceipt> {
        self.shared.schema.get_collection(collection)?;

        let _writer = self.shared.writer.lock();
        let change = {
            let mut collections = self.shared.collections.write();
            let c = collections
                .get_mut(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            let previous = c
                .get(id)
                .cloned()
                .ok_or_else(|| Error::RecordNotFound(id.into()))?;
            if previous.deleted {
                return Err(Error::OperationOnDeleted(id.into()));
            }

            let mut record = previous.clone();
            record.mark_deleted(next_write_stamp(
                self.shared.clock.now(),
                Some(previous.updated_at),
            ));
            let version = c.put(record.clone());
            Change {
                collection: collection.to_string(),
                record,
                previous: Some(previous),
                kind: ChangeKind::Delete,
                origin: WriteOrigin::Local,
                write_id: Some(write_id),
                version,
            }
        };

        self.dispatch(&change);
        Ok(WriteReceipt {
            write_id,
            record: change.record,
        })
    }

    /// Merge a row from the backend through the conflict policy.
    ///
    /// Nothing is dispatched unless the incoming version wins.
    pub fn merge_remote(&self, collection: &str, incoming: Record) -> Result<MergeDecision> {
        let _writer = self.shared.writer.lock();
        let change = {
            let mut collections = self.shared.collections.write();
            let c = collections
                .get_mut(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            let previous = c.get(&incoming.id).cloned();
            let decision = self.shared.policy.decide(previous.as_ref(), &incoming);
            if !decision.applies() {
                return Ok(decision);
            }

            let version = c.put(incoming.clone());
            remote_change(collection, incoming, previous, version)
        };

        self.dispatch(&change);
        Ok(MergeDecision::TakeIncoming)
    }

    /// Replace local state with the backend's authoritative version.
    ///
    /// Used after the backend permanently rejects a write. With no
    /// authoritative row the local record is tombstoned.
    pub fn revert(&self, collection: &str, id: &str, authoritative: Option<Record>) -> Result<()> {
        let _writer = self.shared.writer.lock();
        let change = {
            let mut collections = self.shared.collections.write();
            let c = collections
                .get_mut(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            let previous = c.get(id).cloned();

            let record = match (authoritative, &previous) {
                (Some(row), _) => row,
                (None, Some(prev)) if !prev.deleted => {
                    let mut tombstone = prev.clone();
                    tombstone.mark_deleted(next_write_stamp(
                        self.shared.clock.now(),
                        Some(prev.updated_at),
                    ));
                    tombstone
                }
                (None, _) => return Ok(()),
            };

            let version = c.put(record.clone());
            remote_change(collection, record, previous, version)
        };

        self.dispatch(&change);
        Ok(())
    }

    /// Subscribe to changes of a collection or a single record.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.subscribe_many(vec![topic], callback)
    }

    /// Subscribe to several topics with one callback.
    pub fn subscribe_many<F>(&self, topics: Vec<Topic>, callback: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().push(Subscriber {
            id,
            topics,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Build a read view computed from `dependencies` that recomputes when
    /// any of them changes.
    pub fn derive<T, F>(&self, dependencies: &[&str], compute: F) -> DerivedView<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&Store) -> T + Send + Sync + 'static,
    {
        DerivedView {
            inner: Arc::new(DerivedInner {
                store: self.clone(),
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                compute: Box::new(compute),
                cache: Mutex::new(None),
            }),
        }
    }

    /// Sinks see a change at once. Subscribers get changes in commit order,
    /// one full round each: a change committed by a callback waits in the
    /// outbox until the current round is over.
    fn dispatch(&self, change: &Change) {
        let sinks: Vec<_> = self.shared.sinks.read().iter().cloned().collect();
        for sink in sinks {
            sink.on_change(change);
        }

        self.shared.outbox.lock().push_back(change.clone());
        // The writer lock is held, so only a nested call can see this set.
        if self.shared.delivering.swap(true, Ordering::AcqRel) {
            return;
        }
        let _delivering = DeliveryGuard(&self.shared);
        loop {
            let next = self.shared.outbox.lock().pop_front();
            match next {
                Some(change) => self.notify(&change),
                None => break,
            }
        }
    }

    fn notify(&self, change: &Change) {
        // Snapshot matching callbacks; the lock is not held while calling them.
        let callbacks: Vec<Callback> = self
            .shared
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.topics.iter().any(|t| t.matches(change)))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(change);
        }
    }
}

/// Clears the delivery flag even if a callback panics.
struct DeliveryGuard<'a>(&'a Shared);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.outbox.lock().clear();
        self.0.delivering.store(false, Ordering::Release);
    }
}

fn remote_change(
    collection: &str,
    record: Record,
    previous: Option<Record>,
    version: u64,
) -> Change {
    let kind = match (&previous, record.deleted) {
        (_, true) => ChangeKind::Delete,
        (None, false) => ChangeKind::Create,
        (Some(_), false) => ChangeKind::Update,
    };
    Change {
        collection: collection.to_string(),
        record,
        previous,
        kind,
        origin: WriteOrigin::Remote,
        write_id: None,
        version,
    }
}

struct DerivedInner<T> {
    store: Store,
    dependencies: Vec<CollectionName>,
    compute: Box<dyn Fn(&Store) -> T + Send + Sync>,
    cache: Mutex<Option<(Vec<u64>, Arc<T>)>>,
}

/// A computed read view, e.g. "groups where I am a member".
///
/// The value is cached against the versions of its dependencies and is
/// recomputed lazily on the next read after any of them changes.
pub struct DerivedView<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for DerivedView<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DerivedView<T> {
    /// Current value, recomputed if a dependency changed.
    pub fn get(&self) -> Arc<T> {
        let versions = self.inner.store.versions(&self.inner.dependencies);
        if let Some((seen, value)) = self.inner.cache.lock().as_ref() {
            if *seen == versions {
                return Arc::clone(value);
            }
        }

        let value = Arc::new((self.inner.compute)(&self.inner.store));
        *self.inner.cache.lock() = Some((versions, Arc::clone(&value)));
        value
    }

    /// Call `callback` with the recomputed value after each dependency change.
    ///
    /// The subscription holds the view weakly: once every handle to the view
    /// is dropped the callback stops firing, and the store is not kept alive
    /// by its own subscriber list.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let topics = self
            .inner
            .dependencies
            .iter()
            .cloned()
            .map(Topic::Collection)
            .collect();
        let view = Arc::downgrade(&self.inner);
        self.inner.store.subscribe_many(topics, move |_| {
            if let Some(inner) = view.upgrade() {
                let value = DerivedView { inner }.get();
                callback(&value);
            }
        })
    }
}
