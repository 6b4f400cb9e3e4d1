//! Durable blob formats.
//!
//! Each collection is persisted as its own blob keyed by collection name.
//! The retry queue and the pull cursors each get a separate blob. All maps
//! are `BTreeMap` so serialization is deterministic.

use crate::queue::PendingMutation;
use crate::{error::Result, CollectionName, Error, Record, RecordId, SchemaVersion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the blob format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Blob key of the retry queue.
pub const QUEUE_KEY: &str = "__queue";

/// Blob key of the pull cursors.
pub const CURSORS_KEY: &str = "__cursors";

/// Persisted id -> record map of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    pub collection: CollectionName,
    pub records: BTreeMap<RecordId, Record>,
}

impl CollectionSnapshot {
    pub fn new(
        schema_version: SchemaVersion,
        collection: impl Into<CollectionName>,
        records: BTreeMap<RecordId, Record>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            collection: collection.into(),
            records,
        }
    }

    /// Count active (non-deleted) records.
    pub fn active_record_count(&self) -> usize {
        self.records.values().filter(|r| r.is_active()).count()
    }
}

/// Persisted retry queue, in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub mutations: Vec<PendingMutation>,
}

impl QueueSnapshot {
    pub fn new(schema_version: SchemaVersion, mutations: Vec<PendingMutation>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            mutations,
        }
    }
}

/// Persisted pull positions per collection. A position is only meaningful
/// together with the collection blob it was pulled into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub cursors: BTreeMap<CollectionName, i64>,
}

impl CursorSnapshot {
    pub fn new(schema_version: SchemaVersion, cursors: BTreeMap<CollectionName, i64>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            cursors,
        }
    }
}

/// Serialize a blob.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))
}

/// Deserialize a blob and check its format version.
pub fn from_bytes<T: DeserializeOwned + Versioned>(bytes: &[u8]) -> Result<T> {
    let value: T =
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

    if value.format_version() > SNAPSHOT_FORMAT_VERSION {
        return Err(Error::InvalidSnapshot(format!(
            "unsupported snapshot format version: {} (max supported: {})",
            value.format_version(),
            SNAPSHOT_FORMAT_VERSION
        )));
    }

    Ok(value)
}

/// Blobs that carry a format version.
pub trait Versioned {
    fn format_version(&self) -> u32;
}

impl Versioned for CollectionSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl Versioned for QueueSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}

impl Versioned for CursorSnapshot {
    fn format_version(&self) -> u32 {
        self.format_version
    }
}
