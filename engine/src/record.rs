//! Record types for storing data.
//!
//! A record travels in the same shape everywhere: in memory, in the durable
//! blobs, and on the wire. Schema fields are flattened next to the
//! engine-managed columns.

use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names owned by the engine. Patches may not write them.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "deleted"];

/// A data record in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Client-generated identifier, immutable once created
    pub id: RecordId,
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last written (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
    /// Schema-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a new live record.
    pub fn new(id: impl Into<RecordId>, fields: Map<String, Value>, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            deleted: false,
            fields,
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Read a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Shallow-merge `patch` into the fields and stamp `updated_at`.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>, timestamp: Timestamp) {
        for (key, value) in patch {
            self.fields.insert(key.clone(), value.clone());
        }
        self.updated_at = timestamp;
    }

    /// Mark record as deleted (tombstone). Fields are kept.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.updated_at = timestamp;
    }

    /// Whether two versions carry the same content at the same time.
    pub fn same_version(&self, other: &Record) -> bool {
        self.updated_at == other.updated_at
            && self.deleted == other.deleted
            && self.fields == other.fields
    }
}

/// Convert a JSON value into a field map, rejecting non-objects.
pub fn into_fields(value: Value) -> crate::Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(crate::Error::InvalidPayload(
            "payload must be an object".into(),
        )),
    }
}
