//! The backend contract the sync adapter talks to.
//!
//! A backend exposes named tables of rows in the [`Record`] shape. Rows can
//! be read by snapshot query or by change position, followed on a change
//! feed, upserted, and touched in bulk by remote procedures. [`MemoryBackend`] is an in-process implementation used by
//! tests and demos; [`HttpBackend`] talks to `cadence-server`.

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::{BackendOp, MemoryBackend, Procedure, Tables};

use crate::{Record, RecordId, Timestamp};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Backend failure, as classified by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Connectivity loss
    Network,
    Timeout,
    /// Server temporarily unable to serve (5xx, overload)
    Unavailable,
    /// Missing or expired credentials
    Authorization,
    /// The row failed server-side validation
    Validation,
    /// A unique or foreign key constraint was violated
    Constraint,
}

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff, indefinitely.
    Transient,
    /// Held until the session is re-authenticated.
    Authorization,
    /// Never retried; reported to the caller.
    Permanent,
}

impl BackendErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            BackendErrorKind::Network | BackendErrorKind::Timeout | BackendErrorKind::Unavailable => {
                ErrorClass::Transient
            }
            BackendErrorKind::Authorization => ErrorClass::Authorization,
            BackendErrorKind::Validation | BackendErrorKind::Constraint => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Position in a table's `(updated_at, id)` order. Pulls resume after it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncCursor {
    pub updated_at: Timestamp,
    pub id: RecordId,
}

impl SyncCursor {
    pub fn of(record: &Record) -> Self {
        Self {
            updated_at: record.updated_at,
            id: record.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter, ordering and limit over one table.
///
/// Rows are ordered by `(updated_at, id)`. `after` is a keyset cursor and
/// only applies to ascending queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotQuery {
    /// Field equality filter
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<SyncCursor>,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    pub fn new(filter: Map<String, Value>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Query for a single row by id, ignoring any filter.
    pub fn by_id(id: impl Into<RecordId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn after(mut self, cursor: Option<SyncCursor>) -> Self {
        self.after = cursor;
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` belongs to the result set, ignoring the limit.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(id) = &self.id {
            return record.id == *id;
        }
        if let Some(after) = &self.after {
            if self.order == SortOrder::Asc && SyncCursor::of(record) <= *after {
                return false;
            }
        }
        matches_filter(record, &self.filter)
    }
}

/// Field equality filter. An empty filter matches every row.
pub fn matches_filter(record: &Record, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| record.fields.get(field) == Some(expected))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEventKind {
    Insert,
    Update,
    Delete,
}

/// A row-level event from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub table: String,
    pub kind: FeedEventKind,
    pub row: Record,
}

/// Live change feed of one table. An `Err` item or the end of the stream
/// means the subscription is gone and must be re-established.
pub type ChangeStream = BoxStream<'static, BackendResult<FeedEvent>>;

/// The remote backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a snapshot query.
    async fn query(&self, table: &str, query: &SnapshotQuery) -> BackendResult<Vec<Record>>;

    /// Rows of `table` matching `filter` whose latest write the backend
    /// applied after change position `since`, oldest first, at most
    /// `limit`. Positions are assigned by the backend, so a row stamped by a
    /// lagging client clock still lands after every position handed out
    /// before it was written. Tombstones are included.
    async fn changes_since(
        &self,
        table: &str,
        filter: &Map<String, Value>,
        since: i64,
        limit: usize,
    ) -> BackendResult<ChangePage>;

    /// Subscribe to row events matching `filter`.
    async fn subscribe(
        &self,
        table: &str,
        filter: &Map<String, Value>,
    ) -> BackendResult<ChangeStream>;

    /// Insert-or-update by id. Returns the row the backend now holds, which
    /// may be a newer version than the one sent.
    async fn upsert(&self, table: &str, row: &Record) -> BackendResult<Record>;

    /// Invoke a remote procedure. All-or-nothing on the backend side.
    async fn call(&self, procedure: &str, params: Value) -> BackendResult<Value>;
}

/// Long-poll request for `POST /tables/{table}/changes`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesRequest {
    #[serde(default)]
    pub filter: Map<String, Value>,
    /// Change sequence already seen; `None` asks for the current head
    #[serde(default)]
    pub cursor: Option<i64>,
    /// How long the server may hold the request open
    #[serde(default)]
    pub wait_ms: u64,
    /// Most events to return
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    pub events: Vec<FeedEvent>,
    pub cursor: i64,
}

/// One page of [`Backend::changes_since`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub rows: Vec<Record>,
    /// Position of the last row, or the requested position when empty
    pub cursor: i64,
}

/// Error body returned by `cadence-server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<BackendErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, updated_at: Timestamp, fields: Value) -> Record {
        let mut r = Record::new(id, fields.as_object().cloned().unwrap(), 1);
        r.updated_at = updated_at;
        r
    }

    #[test]
    fn error_classes() {
        assert_eq!(BackendErrorKind::Timeout.class(), ErrorClass::Transient);
        assert_eq!(
            BackendErrorKind::Authorization.class(),
            ErrorClass::Authorization
        );
        assert_eq!(BackendErrorKind::Constraint.class(), ErrorClass::Permanent);
    }

    #[test]
    fn keyset_cursor_orders_by_time_then_id() {
        let query = SnapshotQuery::default().after(Some(SyncCursor {
            updated_at: 10,
            id: "b".into(),
        }));
        assert!(!query.matches(&row("a", 10, json!({}))));
        assert!(!query.matches(&row("b", 10, json!({}))));
        assert!(query.matches(&row("c", 10, json!({}))));
        assert!(query.matches(&row("a", 11, json!({}))));
    }

    #[test]
    fn filter_is_field_equality() {
        let filter = json!({"group_id": "g-1"}).as_object().cloned().unwrap();
        assert!(matches_filter(&row("a", 1, json!({"group_id": "g-1", "x": 1})), &filter));
        assert!(!matches_filter(&row("a", 1, json!({"group_id": "g-2"})), &filter));
        assert!(matches_filter(&row("a", 1, json!({})), &Map::new()));
    }

    #[test]
    fn feed_event_wire_shape() {
        let event = FeedEvent {
            table: "tags".into(),
            kind: FeedEventKind::Delete,
            row: row("t-1", 5, json!({"label": "x"})),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "delete");
        assert_eq!(value["row"]["label"], "x");
        assert_eq!(value["row"]["updated_at"], 5);
    }
}
