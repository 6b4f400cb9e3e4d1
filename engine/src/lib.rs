//! # Cadence Engine
//!
//! A local-first sync engine for apps built on one authoritative backend.
//!
//! Every collection the app syncs lives in an observable in-memory store
//! that is readable and writable offline. Local writes are visible at once,
//! mirrored to durable storage and queued for the backend; rows from the
//! backend are merged back with a last-write-wins rule.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] has a client-generated UUID, schema fields, `created_at` and
//! `updated_at` timestamps and a `deleted` tombstone. Deletes are ordinary
//! writes of the tombstone, so they merge like any other field.
//!
//! ### Store
//!
//! The [`Store`] holds all collections. Writes are synchronous and atomic
//! with respect to subscribers. [`Store::subscribe`] listens to a collection
//! or a single record; [`Store::derive`] builds computed read views.
//!
//! ### Conflict policy
//!
//! [`ConflictPolicy`] compares `updated_at`; the greater wins. On an exact
//! tie the [`TieBreak`] decides, by default in favor of the backend.
//!
//! ### Retry queue
//!
//! Each local write becomes a [`PendingMutation`]. Writes to an unsent
//! record are coalesced, one request per record is in flight at a time and
//! transient failures back off from 1s to at most 30s, forever.
//!
//! ### Sync
//!
//! The [`SyncAdapter`] pulls each collection, follows the live change feed
//! and drains the queue. The UI observes only [`SyncState`].
//!
//! ## Quick Start
//!
//! ```rust
//! use cadence_engine::{
//!     CollectionSchema, FieldDef, FieldType, MemoryBackend, MemoryStorage, Schema,
//!     SyncEngine, SyncOptions,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Define a schema
//! let schema = Schema::new(1).with_collection(CollectionSchema::new(
//!     "groups",
//!     vec![
//!         FieldDef::required("name", FieldType::String),
//!         FieldDef::optional("goal", FieldType::Int),
//!     ],
//! ));
//!
//! // 2. Open the engine; persisted state is loaded here
//! let engine = SyncEngine::open(
//!     schema,
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryBackend::new()),
//!     SyncOptions::default(),
//! )
//! .unwrap();
//!
//! // 3. Write optimistically, even before `start()`
//! let write = engine.insert("groups", json!({"name": "Runners"})).unwrap();
//!
//! // 4. Read your write
//! let record = engine.store().get("groups", &write.record.id).unwrap();
//! assert_eq!(record.field("name"), Some(&json!("Runners")));
//! assert_eq!(engine.pending_count(), 1);
//! ```
//!
//! ## Persistence
//!
//! Each collection is one blob keyed by its name; the retry queue and the
//! pull cursors have their own blobs. See [`BlobStorage`] and
//! [`FileStorage`].

pub mod backend;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod queue;
pub mod record;
pub mod refresh;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod sync;

// Re-export main types at crate root
pub use backend::{
    Backend, BackendError, BackendErrorKind, ErrorClass, FeedEvent, FeedEventKind, HttpBackend,
    MemoryBackend, SnapshotQuery, SyncCursor,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, ConfigError, SyncOptions};
pub use conflict::{ConflictPolicy, MergeDecision, TieBreak};
pub use engine::{PendingWrite, SyncEngine};
pub use error::{Error, Result};
pub use persistence::{BlobStorage, FileStorage, MemoryStorage, Persistence};
pub use queue::{Backoff, Confirmation, Confirmed, MutationOp, PendingMutation};
pub use record::Record;
pub use refresh::{RefreshController, RefreshState};
pub use schema::{CollectionSchema, FieldDef, FieldType, Schema};
pub use store::{Change, ChangeKind, DerivedView, Store, Subscription, Topic, WriteOrigin};
pub use sync::{SessionEvent, SyncAdapter, SyncState};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
