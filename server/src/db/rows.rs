//! Database operations for the rows table.

use cadence_engine::backend::{FeedEvent, FeedEventKind, SnapshotQuery, SortOrder};
use cadence_engine::Record;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgExecutor, Postgres, QueryBuilder, Row};

use crate::error::{AppError, Result};

/// Largest page a snapshot query may ask for.
pub const MAX_PAGE_SIZE: usize = 1000;

const COLUMNS: &str = "id, fields, deleted, created_at, updated_at, change_seq";

/// Last-write-wins upsert. On conflict the stored row is replaced only by a
/// later `updated_at`, or by different content at the same `updated_at`.
/// `created_at` of an existing row is kept. Yields the row held afterwards.
const UPSERT_SQL: &str = r#"
WITH written AS (
    INSERT INTO rows (table_name, id, fields, deleted, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (table_name, id) DO UPDATE SET
        fields = EXCLUDED.fields,
        deleted = EXCLUDED.deleted,
        updated_at = EXCLUDED.updated_at,
        change_seq = nextval('rows_change_seq')
    WHERE rows.updated_at < EXCLUDED.updated_at
       OR (rows.updated_at = EXCLUDED.updated_at
           AND (rows.fields <> EXCLUDED.fields OR rows.deleted <> EXCLUDED.deleted))
    RETURNING id, fields, deleted, created_at, updated_at, change_seq
)
SELECT id, fields, deleted, created_at, updated_at, change_seq, TRUE AS changed
FROM written
UNION ALL
SELECT id, fields, deleted, created_at, updated_at, change_seq, FALSE AS changed
FROM rows
WHERE table_name = $1 AND id = $2 AND NOT EXISTS (SELECT 1 FROM written)
"#;

/// A stored row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub fields: Map<String, Value>,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub change_seq: i64,
}

impl<'r> FromRow<'r, PgRow> for StoredRow {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let Json(fields): Json<Map<String, Value>> = row.try_get("fields")?;
        Ok(StoredRow {
            id: row.try_get("id")?,
            fields,
            deleted: row.try_get("deleted")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            change_seq: row.try_get("change_seq")?,
        })
    }
}

impl StoredRow {
    /// Convert database row to the wire record.
    pub fn to_record(&self) -> Record {
        Record {
            id: self.id.clone(),
            created_at: self.created_at.max(0) as u64,
            updated_at: self.updated_at.max(0) as u64,
            deleted: self.deleted,
            fields: self.fields.clone(),
        }
    }

    /// Feed event for the row's current version. A row never written since
    /// its creation is an insert.
    pub fn to_event(&self, table: &str) -> FeedEvent {
        let kind = if self.deleted {
            FeedEventKind::Delete
        } else if self.created_at == self.updated_at {
            FeedEventKind::Insert
        } else {
            FeedEventKind::Update
        };
        FeedEvent {
            table: table.to_string(),
            kind,
            row: self.to_record(),
        }
    }
}

fn timestamp(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| AppError::BadRequest(format!("{field} out of range")))
}

/// Serialize writers of `table` until the transaction ends, so change
/// sequence numbers of one table commit in order.
pub async fn lock_table(conn: &mut PgConnection, table: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(table)
        .execute(conn)
        .await?;
    Ok(())
}

/// Upsert a row. Returns the row held afterwards and whether it changed.
pub async fn upsert_row<'e, E>(executor: E, table: &str, record: &Record) -> Result<(StoredRow, bool)>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(UPSERT_SQL)
        .bind(table)
        .bind(&record.id)
        .bind(Json(&record.fields))
        .bind(record.deleted)
        .bind(timestamp(record.created_at, "created_at")?)
        .bind(timestamp(record.updated_at, "updated_at")?)
        .fetch_one(executor)
        .await?;

    let changed: bool = row.try_get("changed")?;
    Ok((StoredRow::from_row(&row)?, changed))
}

/// Get a row by table and id, tombstones included.
pub async fn get_row<'e, E>(executor: E, table: &str, id: &str) -> Result<Option<StoredRow>>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, StoredRow>(&format!(
        "SELECT {COLUMNS} FROM rows WHERE table_name = $1 AND id = $2"
    ))
    .bind(table)
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Run a snapshot query in `(updated_at, id)` order.
pub async fn query_rows<'e, E>(executor: E, table: &str, query: &SnapshotQuery) -> Result<Vec<StoredRow>>
where
    E: PgExecutor<'e>,
{
    let limit = query.limit.unwrap_or(MAX_PAGE_SIZE);
    if limit > MAX_PAGE_SIZE {
        return Err(AppError::BadRequest(format!(
            "limit {limit} exceeds maximum page size {MAX_PAGE_SIZE}"
        )));
    }

    let mut sql = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM rows WHERE table_name = "));
    sql.push_bind(table.to_string());

    if let Some(id) = &query.id {
        sql.push(" AND id = ").push_bind(id.clone());
    } else {
        if !query.filter.is_empty() {
            sql.push(" AND fields @> ").push_bind(Json(query.filter.clone()));
        }
        if let (Some(after), SortOrder::Asc) = (&query.after, query.order) {
            sql.push(" AND (updated_at, id) > (")
                .push_bind(timestamp(after.updated_at, "cursor")?)
                .push(", ")
                .push_bind(after.id.clone())
                .push(")");
        }
    }

    sql.push(match query.order {
        SortOrder::Asc => " ORDER BY updated_at ASC, id ASC",
        SortOrder::Desc => " ORDER BY updated_at DESC, id DESC",
    });
    sql.push(" LIMIT ").push_bind(limit as i64);

    let rows = sql.build_query_as::<StoredRow>().fetch_all(executor).await?;
    Ok(rows)
}

/// Rows of `table` matching `filter` changed after change sequence `cursor`,
/// oldest change first.
pub async fn changes_since<'e, E>(
    executor: E,
    table: &str,
    filter: &Map<String, Value>,
    cursor: i64,
    limit: i64,
) -> Result<Vec<StoredRow>>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, StoredRow>(&format!(
        "SELECT {COLUMNS} FROM rows \
         WHERE table_name = $1 AND change_seq > $2 AND fields @> $3 \
         ORDER BY change_seq ASC LIMIT $4"
    ))
    .bind(table)
    .bind(cursor)
    .bind(Json(filter))
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Latest change sequence of `table`, 0 when it has no rows.
pub async fn head_seq<'e, E>(executor: E, table: &str) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let head = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(change_seq), 0) FROM rows WHERE table_name = $1",
    )
    .bind(table)
    .fetch_one(executor)
    .await?;
    Ok(head)
}

/// Count live rows of `table` whose fields contain `filter`.
pub async fn count_rows<'e, E>(executor: E, table: &str, filter: &Map<String, Value>) -> Result<i64>
where
    E: PgExecutor<'e>,
{
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM rows WHERE table_name = $1 AND NOT deleted AND fields @> $2",
    )
    .bind(table)
    .bind(Json(filter))
    .fetch_one(executor)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(created_at: i64, updated_at: i64, deleted: bool) -> StoredRow {
        StoredRow {
            id: "g-1".into(),
            fields: json!({"name": "Runners"}).as_object().cloned().unwrap(),
            deleted,
            created_at,
            updated_at,
            change_seq: 7,
        }
    }

    #[test]
    fn row_converts_to_record() {
        let record = stored(100, 200, false).to_record();
        assert_eq!(record.id, "g-1");
        assert_eq!(record.created_at, 100);
        assert_eq!(record.updated_at, 200);
        assert_eq!(record.field("name"), Some(&json!("Runners")));
    }

    #[test]
    fn event_kinds() {
        assert_eq!(stored(100, 100, false).to_event("groups").kind, FeedEventKind::Insert);
        assert_eq!(stored(100, 200, false).to_event("groups").kind, FeedEventKind::Update);
        assert_eq!(stored(100, 200, true).to_event("groups").kind, FeedEventKind::Delete);
    }

    #[test]
    fn timestamps_must_fit_bigint() {
        assert_eq!(timestamp(42, "updated_at").unwrap(), 42);
        assert!(timestamp(u64::MAX, "updated_at").is_err());
    }
}
