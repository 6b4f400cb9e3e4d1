//! Persistence - the durable on-device mirror of the store.
//!
//! [`Persistence::open`] reads every blob synchronously so the app can render
//! last-known state before any network activity. After that, writes are
//! fire-and-forget: they are sent over a channel to a single writer thread
//! that applies them in arrival order, so the durable copy never regresses
//! to an older in-flight write. Bursts are coalesced into one blob write per
//! key. A failed write is logged and the app carries on in memory.

use crate::queue::PendingMutation;
use crate::snapshot::{
    from_bytes, to_bytes, CollectionSnapshot, CursorSnapshot, QueueSnapshot, CURSORS_KEY,
    QUEUE_KEY,
};
use crate::store::{Change, ChangeSink};
use crate::{error::Result, CollectionName, Error, Record, RecordId, Schema, SchemaVersion};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Key/value blob storage on the device.
pub trait BlobStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Blobs held in memory. Shares its contents across clones, which lets
/// tests simulate a process restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write to '{key}' refused")));
        }
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl BlobStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        // Write-then-rename so a crash never leaves a torn blob.
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        let mut file = File::create(&tmp).map_err(|e| Error::Storage(e.to_string()))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| Error::Storage(e.to_string()))?;
        std::fs::rename(&tmp, self.path(key)).map_err(|e| Error::Storage(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }
}

/// Everything read back at boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    pub collections: BTreeMap<CollectionName, BTreeMap<RecordId, Record>>,
    pub queue: Vec<PendingMutation>,
    pub cursors: BTreeMap<CollectionName, i64>,
}

enum Command {
    Record {
        collection: CollectionName,
        record: Record,
    },
    Queue(Vec<PendingMutation>),
    Cursors(BTreeMap<CollectionName, i64>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the durable mirror.
pub struct Persistence {
    tx: mpsc::UnboundedSender<Command>,
    healthy: Arc<AtomicBool>,
}

impl Persistence {
    /// Read all blobs for `schema` and start the writer thread.
    pub fn open(storage: Arc<dyn BlobStorage>, schema: &Schema) -> Result<(Self, LoadedState)> {
        let loaded = load_all(storage.as_ref(), schema);
        let (tx, rx) = mpsc::unbounded_channel();
        let healthy = Arc::new(AtomicBool::new(true));

        let writer = Writer {
            storage,
            schema_version: schema.version,
            mirror: loaded.collections.clone(),
            healthy: healthy.clone(),
        };
        std::thread::Builder::new()
            .name("cadence-persist".into())
            .spawn(move || writer.run(rx))
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok((Self { tx, healthy }, loaded))
    }

    /// Persist one record of a collection.
    pub fn persist(&self, collection: &str, record: Record) {
        self.send(Command::Record {
            collection: collection.to_string(),
            record,
        });
    }

    /// Persist the whole retry queue.
    pub fn persist_queue(&self, mutations: Vec<PendingMutation>) {
        self.send(Command::Queue(mutations));
    }

    /// Persist the pull positions.
    pub fn persist_cursors(&self, cursors: BTreeMap<CollectionName, i64>) {
        self.send(Command::Cursors(cursors));
    }

    /// Wait until every write sent so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx));
        let _ = rx.await;
    }

    /// Blocking variant of [`Persistence::flush`] for non-async callers.
    pub fn flush_blocking(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx));
        let _ = rx.blocking_recv();
    }

    /// False once any write has failed this session.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("persistence writer is gone; continuing in memory");
            self.healthy.store(false, Ordering::SeqCst);
        }
    }
}

impl ChangeSink for Persistence {
    fn on_change(&self, change: &Change) {
        self.persist(&change.collection, change.record.clone());
    }
}

fn load_all(storage: &dyn BlobStorage, schema: &Schema) -> LoadedState {
    let mut loaded = LoadedState::default();

    for name in schema.collection_names() {
        let Some(snapshot) = read_blob::<CollectionSnapshot>(storage, &name) else {
            continue;
        };
        if snapshot.schema_version != schema.version {
            tracing::warn!(
                collection = %name,
                expected = schema.version,
                found = snapshot.schema_version,
                "discarding persisted collection from another schema version"
            );
            continue;
        }
        loaded.collections.insert(name, snapshot.records);
    }

    if let Some(queue) = read_blob::<QueueSnapshot>(storage, QUEUE_KEY) {
        if queue.schema_version != schema.version {
            tracing::warn!(
                dropped = queue.mutations.len(),
                "discarding pending mutations from another schema version"
            );
        } else {
            let (known, unknown): (Vec<_>, Vec<_>) = queue
                .mutations
                .into_iter()
                .partition(|m| schema.collections.contains_key(&m.collection));
            if !unknown.is_empty() {
                tracing::warn!(
                    dropped = unknown.len(),
                    "dropping pending mutations for unknown collections"
                );
            }
            loaded.queue = known;
        }
    }

    // A position without its collection's records would skip every row
    // pulled before it, so keep only those whose blob was loaded.
    if let Some(snapshot) = read_blob::<CursorSnapshot>(storage, CURSORS_KEY) {
        if snapshot.schema_version != schema.version {
            tracing::warn!("discarding pull positions from another schema version");
        } else {
            let (kept, dropped): (BTreeMap<_, _>, BTreeMap<_, _>) = snapshot
                .cursors
                .into_iter()
                .partition(|(name, _)| loaded.collections.contains_key(name));
            if !dropped.is_empty() {
                tracing::warn!(
                    dropped = dropped.len(),
                    "dropping pull positions of collections that were not loaded"
                );
            }
            loaded.cursors = kept;
        }
    }

    tracing::info!(
        collections = loaded.collections.len(),
        pending = loaded.queue.len(),
        "loaded persisted state"
    );
    loaded
}

fn read_blob<T>(storage: &dyn BlobStorage, key: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned + crate::snapshot::Versioned,
{
    match storage.read(key) {
        Ok(Some(bytes)) => match from_bytes(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ignoring unreadable blob");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to read blob");
            None
        }
    }
}

struct Writer {
    storage: Arc<dyn BlobStorage>,
    schema_version: SchemaVersion,
    mirror: BTreeMap<CollectionName, BTreeMap<RecordId, Record>>,
    healthy: Arc<AtomicBool>,
}

impl Writer {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(first) = rx.blocking_recv() {
            let mut dirty = BTreeSet::new();
            let mut queue = None;
            let mut cursors = None;
            let mut flushes = Vec::new();

            let mut next = Some(first);
            while let Some(command) = next {
                match command {
                    Command::Record { collection, record } => {
                        self.mirror
                            .entry(collection.clone())
                            .or_default()
                            .insert(record.id.clone(), record);
                        dirty.insert(collection);
                    }
                    Command::Queue(mutations) => queue = Some(mutations),
                    Command::Cursors(c) => cursors = Some(c),
                    Command::Flush(done) => flushes.push(done),
                }
                next = rx.try_recv().ok();
            }

            for collection in dirty {
                let records = self.mirror.get(&collection).cloned().unwrap_or_default();
                let snapshot = CollectionSnapshot::new(self.schema_version, &collection, records);
                self.write(&collection, &snapshot);
            }
            if let Some(mutations) = queue {
                self.write(QUEUE_KEY, &QueueSnapshot::new(self.schema_version, mutations));
            }
            if let Some(cursors) = cursors {
                self.write(CURSORS_KEY, &CursorSnapshot::new(self.schema_version, cursors));
            }
            for done in flushes {
                let _ = done.send(());
            }
        }
        tracing::debug!("persistence writer stopped");
    }

    fn write<T: serde::Serialize>(&self, key: &str, value: &T) {
        let result = to_bytes(value).and_then(|bytes| self.storage.write(key, &bytes));
        if let Err(e) = result {
            tracing::warn!(key = %key, error = %e, "persist failed; continuing in memory");
            self.healthy.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, FieldDef, FieldType};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1).with_collection(CollectionSchema::new(
            "tags",
            vec![FieldDef::required("label", FieldType::String)],
        ))
    }

    fn tag(id: &str, label: &str, updated_at: u64) -> Record {
        let mut r = Record::new(id, json!({"label": label}).as_object().cloned().unwrap(), 1);
        r.updated_at = updated_at;
        r
    }

    #[test]
    fn empty_storage_loads_nothing() {
        let (_p, loaded) = Persistence::open(Arc::new(MemoryStorage::new()), &schema()).unwrap();
        assert_eq!(loaded, LoadedState::default());
    }

    #[test]
    fn writes_apply_in_arrival_order() {
        let storage = MemoryStorage::new();
        let (p, _) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();

        p.persist("tags", tag("t-1", "first", 1));
        p.persist("tags", tag("t-1", "second", 2));
        p.persist("tags", tag("t-2", "other", 3));
        p.flush_blocking();

        let (_p2, loaded) = Persistence::open(Arc::new(storage), &schema()).unwrap();
        let tags = &loaded.collections["tags"];
        assert_eq!(tags.len(), 2);
        assert_eq!(tags["t-1"].field("label"), Some(&json!("second")));
    }

    #[test]
    fn queue_and_cursors_have_their_own_blobs() {
        let storage = MemoryStorage::new();
        let (p, _) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();

        let mut cursors = BTreeMap::new();
        cursors.insert("tags".to_string(), 9);
        p.persist_cursors(cursors.clone());
        p.persist_queue(vec![]);
        p.persist("tags", tag("t-1", "a", 1));
        p.flush_blocking();

        assert_eq!(storage.keys(), vec!["__cursors", "__queue", "tags"]);
        let (_p2, loaded) = Persistence::open(Arc::new(storage), &schema()).unwrap();
        assert_eq!(loaded.cursors, cursors);
    }

    #[test]
    fn failed_writes_are_not_fatal() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        let (p, _) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();

        p.persist("tags", tag("t-1", "a", 1));
        p.flush_blocking();

        assert!(!p.is_healthy());
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn other_schema_version_is_discarded() {
        let storage = MemoryStorage::new();
        let (p, _) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();
        p.persist("tags", tag("t-1", "a", 1));
        p.flush_blocking();

        let mut newer = schema();
        newer.version = 2;
        let (_p2, loaded) = Persistence::open(Arc::new(storage), &newer).unwrap();
        assert!(loaded.collections.is_empty());
    }

    #[test]
    fn positions_without_their_records_are_dropped() {
        let storage = MemoryStorage::new();
        let (p, _) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();
        p.persist("tags", tag("t-1", "a", 1));
        p.persist_cursors(BTreeMap::from([("tags".to_string(), 4)]));
        p.flush_blocking();

        // Schema upgrade: records and positions go together.
        let mut newer = schema();
        newer.version = 2;
        let (_p2, loaded) = Persistence::open(Arc::new(storage.clone()), &newer).unwrap();
        assert!(loaded.cursors.is_empty());

        // A lost collection blob takes its position with it.
        storage.write("tags", b"{ torn").unwrap();
        let (_p3, loaded) = Persistence::open(Arc::new(storage.clone()), &schema()).unwrap();
        assert!(loaded.collections.is_empty());
        assert!(loaded.cursors.is_empty());
    }

    #[test]
    fn corrupt_blob_is_skipped() {
        let storage = MemoryStorage::new();
        storage.write("tags", b"{ nope").unwrap();
        let (_p, loaded) = Persistence::open(Arc::new(storage), &schema()).unwrap();
        assert!(loaded.collections.is_empty());
    }

    #[test]
    fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state")).unwrap();

        assert_eq!(storage.read("tags").unwrap(), None);
        storage.write("tags", b"hello").unwrap();
        assert_eq!(storage.read("tags").unwrap(), Some(b"hello".to_vec()));
        assert!(!dir.path().join("state").join("tags.json.tmp").exists());
        storage.remove("tags").unwrap();
        storage.remove("tags").unwrap();
        assert_eq!(storage.read("tags").unwrap(), None);
    }
}
