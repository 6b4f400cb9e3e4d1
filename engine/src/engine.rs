//! The sync engine facade.
//!
//! Boot order matters: persisted state is read and loaded into the store
//! before anything touches the network, so the UI can render last-known
//! data immediately. Only [`SyncEngine::start`] begins pulling and pushing.

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncOptions;
use crate::conflict::ConflictPolicy;
use crate::persistence::{BlobStorage, Persistence};
use crate::queue::{Confirmation, MutationQueue};
use crate::refresh::RefreshController;
use crate::store::Store;
use crate::sync::{SessionEvent, SyncAdapter, SyncState};
use crate::{error::Result, Error, Record, Schema};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// An optimistic local write: already visible in the store, confirmed
/// later by the backend.
#[derive(Debug)]
pub struct PendingWrite {
    pub record: Record,
    pub confirmation: Confirmation,
}

pub struct SyncEngine {
    store: Store,
    backend: Arc<dyn Backend>,
    queue: Arc<MutationQueue>,
    persistence: Arc<Persistence>,
    adapter: Arc<SyncAdapter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    signed_out: AtomicBool,
}

impl SyncEngine {
    /// Load persisted state and prepare to sync against `backend`.
    pub fn open(
        schema: Schema,
        storage: Arc<dyn BlobStorage>,
        backend: Arc<dyn Backend>,
        options: SyncOptions,
    ) -> Result<Self> {
        Self::open_with_clock(schema, storage, backend, options, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        schema: Schema,
        storage: Arc<dyn BlobStorage>,
        backend: Arc<dyn Backend>,
        options: SyncOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (persistence, loaded) = Persistence::open(storage, &schema)?;
        let persistence = Arc::new(persistence);
        let policy = ConflictPolicy::new(options.tie_break);

        let store = Store::new(schema, clock.clone(), policy);
        store.hydrate(loaded.collections);

        let queue = Arc::new(MutationQueue::new(
            options.backoff,
            clock.clone(),
            policy,
            Some(persistence.clone()),
        ));
        queue.restore(loaded.queue);

        store.add_sink(queue.clone());
        store.add_sink(persistence.clone());

        let adapter = Arc::new(SyncAdapter::new(
            store.clone(),
            backend.clone(),
            queue.clone(),
            persistence.clone(),
            clock,
            options,
            loaded.cursors,
        ));

        Ok(Self {
            store,
            backend,
            queue,
            persistence,
            adapter,
            tasks: Mutex::new(Vec::new()),
            signed_out: AtomicBool::new(false),
        })
    }

    /// Start pulling, following the live feed and pushing. Must be called
    /// inside a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        self.ensure_signed_in()?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        tasks.push(tokio::spawn(self.adapter.clone().run_push_loop()));
        for name in self.store.schema().collection_names() {
            tasks.push(tokio::spawn(self.adapter.clone().run_collection(name)));
        }
        tracing::info!(tasks = tasks.len(), "sync started");
        Ok(())
    }

    /// The observable store. Reads are always local.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a record with a client-generated id.
    pub fn insert(&self, collection: &str, fields: Value) -> Result<PendingWrite> {
        let id = crate::identity::new_record_id();
        self.set(collection, &id, fields)
    }

    /// Create or patch a record.
    pub fn set(&self, collection: &str, id: &str, patch: Value) -> Result<PendingWrite> {
        self.ensure_signed_in()?;
        let write_id = Uuid::new_v4();
        let confirmation = self.queue.expect(write_id);
        match self.store.set_tracked(collection, id, patch, write_id) {
            Ok(receipt) => Ok(PendingWrite {
                record: receipt.record,
                confirmation,
            }),
            Err(e) => {
                self.queue.forget(write_id);
                Err(e)
            }
        }
    }

    /// Soft-delete a record.
    pub fn delete(&self, collection: &str, id: &str) -> Result<PendingWrite> {
        self.ensure_signed_in()?;
        let write_id = Uuid::new_v4();
        let confirmation = self.queue.expect(write_id);
        match self.store.delete_tracked(collection, id, write_id) {
            Ok(receipt) => Ok(PendingWrite {
                record: receipt.record,
                confirmation,
            }),
            Err(e) => {
                self.queue.forget(write_id);
                Err(e)
            }
        }
    }

    pub fn sync_state(&self, collection: &str) -> Option<watch::Receiver<SyncState>> {
        self.adapter.state(collection)
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.adapter.session_events()
    }

    /// Invoke a remote procedure. Requires connectivity; never queued.
    pub async fn call(&self, procedure: &str, params: Value) -> Result<Value> {
        self.ensure_signed_in()?;
        self.adapter.call(procedure, params).await
    }

    /// A refresh controller for a server-computed view produced by
    /// `procedure`, e.g. a leaderboard.
    pub fn aggregate_view(
        &self,
        procedure: &str,
        params: Value,
        interval: Duration,
    ) -> RefreshController<Value> {
        let backend = self.backend.clone();
        let procedure = procedure.to_string();
        RefreshController::new(interval, move || {
            let backend = backend.clone();
            let procedure = procedure.clone();
            let params = params.clone();
            async move { backend.call(&procedure, params).await }
        })
    }

    /// Resume sync after the user re-authenticated.
    pub fn reauthenticated(&self) {
        self.adapter.resume();
    }

    /// Pull `collection` now, e.g. for pull-to-refresh. Returns the number
    /// of rows received since the last pull.
    pub async fn pull(&self, collection: &str) -> Result<usize> {
        self.ensure_signed_in()?;
        Ok(self.adapter.pull_collection(collection).await?)
    }

    /// Push everything that is due right now.
    pub async fn flush_pending(&self) -> usize {
        self.adapter.flush().await
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    /// False once a persistence write failed; the session then continues
    /// in memory.
    pub fn is_persistence_healthy(&self) -> bool {
        self.persistence.is_healthy()
    }

    /// Stop all sync activity. Pending mutations stay persisted for the
    /// next session.
    pub async fn sign_out(&self) {
        if self.signed_out.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tasks();
        self.queue.shut_down();
        self.persistence.persist_queue(self.queue.snapshot());
        self.persistence.flush().await;
        tracing::info!(pending = self.queue.pending_count(), "signed out");
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn ensure_signed_in(&self) -> Result<()> {
        if self.signed_out.load(Ordering::SeqCst) {
            Err(Error::SignedOut)
        } else {
            Ok(())
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
