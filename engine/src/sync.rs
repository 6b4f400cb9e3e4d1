//! Remote sync adapter.
//!
//! Bridges the store and the backend with three independently failing
//! paths:
//!
//! - **pull**: pages through each collection in the backend's change order
//!   after the persisted change position and merges every row;
//! - **live feed**: merges row events as they arrive, re-subscribing with
//!   backoff and a catch-up pull whenever the feed drops;
//! - **push**: drains the retry queue, one request in flight per record.
//!
//! Every inbound row goes through [`Store::merge_remote`], so duplicates and
//! out-of-order deliveries are harmless.

use crate::backend::{
    Backend, BackendError, BackendErrorKind, ErrorClass, FeedEvent, FeedEventKind, SnapshotQuery,
};
use crate::clock::Clock;
use crate::config::SyncOptions;
use crate::persistence::Persistence;
use crate::queue::{FailureOutcome, MutationQueue, PendingMutation};
use crate::store::Store;
use crate::{error::Result, CollectionName, Error, Timestamp};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// How long the push loop sleeps when nothing is due.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Sync health of one collection, as shown to the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Persisted records have been loaded into the store
    pub is_persist_loaded: bool,
    /// The initial remote pull has completed
    pub is_loaded: bool,
    /// Last background failure, cleared by the next success
    pub last_error: Option<BackendError>,
    pub last_synced_at: Option<Timestamp>,
    /// A local write of this collection is being retried
    pub retrying: bool,
}

/// Session-level signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The backend refused the credential. Sync is paused until
    /// [`SyncAdapter::resume`].
    Invalidated { reason: String },
    Resumed,
}

pub struct SyncAdapter {
    store: Store,
    backend: Arc<dyn Backend>,
    queue: Arc<MutationQueue>,
    persistence: Arc<Persistence>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    states: HashMap<CollectionName, watch::Sender<SyncState>>,
    /// Change position each collection has been pulled up to
    cursors: Mutex<BTreeMap<CollectionName, i64>>,
    session: broadcast::Sender<SessionEvent>,
    auth_paused: watch::Sender<bool>,
}

impl SyncAdapter {
    pub fn new(
        store: Store,
        backend: Arc<dyn Backend>,
        queue: Arc<MutationQueue>,
        persistence: Arc<Persistence>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
        cursors: BTreeMap<CollectionName, i64>,
    ) -> Self {
        let states = store
            .schema()
            .collection_names()
            .into_iter()
            .map(|name| {
                let state = SyncState {
                    is_persist_loaded: true,
                    retrying: queue.has_retrying(&name),
                    ..SyncState::default()
                };
                (name, watch::channel(state).0)
            })
            .collect();
        let (session, _) = broadcast::channel(16);

        Self {
            store,
            backend,
            queue,
            persistence,
            clock,
            options,
            states,
            cursors: Mutex::new(cursors),
            session,
            auth_paused: watch::channel(false).0,
        }
    }

    /// Watch the sync state of `collection`.
    pub fn state(&self, collection: &str) -> Option<watch::Receiver<SyncState>> {
        self.states.get(collection).map(|s| s.subscribe())
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.auth_paused.borrow()
    }

    /// Pull every row of `collection` the backend changed after the stored
    /// change position. Without one, the whole collection is pulled.
    ///
    /// Returns the number of rows received.
    pub async fn pull_collection(
        &self,
        collection: &str,
    ) -> std::result::Result<usize, BackendError> {
        let filter = self
            .store
            .schema()
            .get_collection(collection)
            .map(|s| s.filter.clone())
            .map_err(|e| BackendError::new(BackendErrorKind::Validation, e.to_string()))?;
        let page_size = self.options.pull_page_size.max(1);
        let mut cursor = self.cursors.lock().get(collection).copied().unwrap_or(0);
        let mut total = 0;

        loop {
            let page = self
                .backend
                .changes_since(collection, &filter, cursor, page_size)
                .await?;
            let received = page.rows.len();
            for row in page.rows {
                self.merge(collection, row);
            }
            total += received;

            if page.cursor <= cursor {
                break;
            }
            cursor = page.cursor;
            {
                let mut cursors = self.cursors.lock();
                cursors.insert(collection.to_string(), cursor);
                self.persistence.persist_cursors(cursors.clone());
            }
            if received < page_size {
                break;
            }
        }

        let now = self.clock.now();
        self.update_state(collection, |s| {
            s.is_loaded = true;
            s.last_error = None;
            s.last_synced_at = Some(now);
        });
        tracing::info!(collection = %collection, rows = total, "pull complete");
        Ok(total)
    }

    /// Merge one live feed event.
    pub fn apply_feed_event(&self, collection: &str, event: FeedEvent) {
        let mut row = event.row;
        if event.kind == FeedEventKind::Delete {
            row.deleted = true;
        }
        self.merge(collection, row);
    }

    fn merge(&self, collection: &str, row: crate::Record) {
        let id = row.id.clone();
        match self.store.merge_remote(collection, row) {
            Ok(decision) => {
                tracing::trace!(collection = %collection, record_id = %id, ?decision, "merged row");
            }
            Err(e) => {
                tracing::warn!(
                    collection = %collection,
                    record_id = %id,
                    error = %e,
                    "failed to merge row"
                );
            }
        }
    }

    /// Send one pending mutation and settle it.
    pub async fn push_mutation(&self, mutation: PendingMutation) {
        let PendingMutation {
            id,
            collection,
            record_id,
            payload,
            ..
        } = mutation;

        match self.backend.upsert(&collection, &payload).await {
            Ok(stored) => {
                self.queue.confirm(id);
                self.merge(&collection, stored);
                let now = self.clock.now();
                let retrying = self.queue.has_retrying(&collection);
                self.update_state(&collection, |s| {
                    s.last_synced_at = Some(now);
                    s.retrying = retrying;
                });
                tracing::debug!(collection = %collection, record_id = %record_id, "push confirmed");
            }
            Err(err) => match self.queue.fail(id, &err) {
                Some(FailureOutcome::Retry { attempts, at }) => {
                    tracing::debug!(
                        collection = %collection,
                        record_id = %record_id,
                        attempts,
                        retry_at = at,
                        error = %err,
                        "push failed, will retry"
                    );
                    self.update_state(&collection, |s| s.retrying = true);
                }
                Some(FailureOutcome::Dropped(_)) => {
                    tracing::warn!(
                        collection = %collection,
                        record_id = %record_id,
                        error = %err,
                        "push rejected, rolling back"
                    );
                    let retrying = self.queue.has_retrying(&collection);
                    self.update_state(&collection, |s| {
                        s.last_error = Some(err.clone());
                        s.retrying = retrying;
                    });
                    self.roll_back(&collection, &record_id).await;
                }
                Some(FailureOutcome::Paused) => self.pause(&err),
                None => {}
            },
        }
    }

    /// Replace a rejected optimistic write with what the backend holds.
    async fn roll_back(&self, collection: &str, record_id: &str) {
        match self
            .backend
            .query(collection, &SnapshotQuery::by_id(record_id))
            .await
        {
            Ok(rows) => {
                let authoritative = rows.into_iter().next();
                if let Err(e) = self.store.revert(collection, record_id, authoritative) {
                    tracing::warn!(
                        collection = %collection,
                        record_id = %record_id,
                        error = %e,
                        "rollback failed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    collection = %collection,
                    record_id = %record_id,
                    error = %e,
                    "could not fetch authoritative row; keeping local version"
                );
            }
        }
    }

    /// Push every mutation that is due, concurrently across records.
    ///
    /// Returns the number of mutations sent.
    pub async fn flush(&self) -> usize {
        let ready = self.queue.take_ready();
        let sent = ready.len();
        futures::future::join_all(ready.into_iter().map(|m| self.push_mutation(m))).await;
        sent
    }

    /// Drain the queue forever, sleeping until the next retry is due.
    pub async fn run_push_loop(self: Arc<Self>) {
        loop {
            self.flush().await;

            let wait = match self.queue.next_due() {
                Some(at) => Duration::from_millis(at.saturating_sub(self.clock.now())),
                None => IDLE_WAIT,
            };
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Keep one collection in sync: pull, then follow the live feed,
    /// reconnecting with backoff and a catch-up pull whenever it drops.
    pub async fn run_collection(self: Arc<Self>, collection: CollectionName) {
        let filter = match self.store.schema().get_collection(&collection) {
            Ok(schema) => schema.filter.clone(),
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "not syncing unknown collection");
                return;
            }
        };
        let mut attempt = 0u32;

        loop {
            self.wait_until_authorized().await;

            // Subscribe before pulling so nothing written in between is missed.
            let feed = if self.options.live_feed {
                match self.backend.subscribe(&collection, &filter).await {
                    Ok(feed) => Some(feed),
                    Err(err) => {
                        attempt += 1;
                        self.background_failure(&collection, &err);
                        tokio::time::sleep(self.options.backoff.delay(attempt)).await;
                        continue;
                    }
                }
            } else {
                None
            };

            if let Err(err) = self.pull_collection(&collection).await {
                attempt += 1;
                self.background_failure(&collection, &err);
                tokio::time::sleep(self.options.backoff.delay(attempt)).await;
                continue;
            }
            attempt = 0;

            let Some(mut feed) = feed else {
                return;
            };
            while let Some(item) = feed.next().await {
                match item {
                    Ok(event) => self.apply_feed_event(&collection, event),
                    Err(err) => {
                        self.background_failure(&collection, &err);
                        break;
                    }
                }
            }

            attempt += 1;
            tracing::info!(collection = %collection, attempt, "live feed ended, reconnecting");
            tokio::time::sleep(self.options.backoff.delay(attempt)).await;
        }
    }

    /// Invoke a remote procedure. Never queued.
    pub async fn call(&self, procedure: &str, params: Value) -> Result<Value> {
        self.backend
            .call(procedure, params)
            .await
            .map_err(|err| match err.class() {
                ErrorClass::Authorization => {
                    self.pause(&err);
                    Error::Backend(err)
                }
                ErrorClass::Permanent => Error::rejected(&err),
                ErrorClass::Transient => Error::Backend(err),
            })
    }

    /// Lift an authorization pause after the user signed in again.
    pub fn resume(&self) {
        if self.auth_paused.send_replace(false) {
            tracing::info!("session resumed");
            let _ = self.session.send(SessionEvent::Resumed);
        }
        self.queue.resume();
    }

    fn background_failure(&self, collection: &str, err: &BackendError) {
        if err.class() == ErrorClass::Authorization {
            self.pause(err);
            return;
        }
        tracing::warn!(collection = %collection, error = %err, "background sync failed");
        self.update_state(collection, |s| s.last_error = Some(err.clone()));
    }

    fn pause(&self, err: &BackendError) {
        if !self.auth_paused.send_replace(true) {
            tracing::warn!(error = %err, "credential rejected, pausing sync");
            let _ = self.session.send(SessionEvent::Invalidated {
                reason: err.message.clone(),
            });
        }
    }

    async fn wait_until_authorized(&self) {
        let mut paused = self.auth_paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return;
            }
        }
    }

    fn update_state(&self, collection: &str, modify: impl FnOnce(&mut SyncState)) {
        if let Some(state) = self.states.get(collection) {
            state.send_modify(modify);
        }
    }
}
