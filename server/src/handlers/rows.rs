//! Snapshot queries and row upserts.

use cadence_engine::backend::SnapshotQuery;
use cadence_engine::Record;

use crate::db;
use crate::error::{AppError, Result};
use crate::feed::FeedHub;

/// Run a snapshot query against one table.
pub async fn handle_query(pool: &db::Pool, table: &str, query: SnapshotQuery) -> Result<Vec<Record>> {
    let rows = db::query_rows(pool, table, &query).await?;
    tracing::debug!(table = %table, rows = rows.len(), "snapshot query");
    Ok(rows.iter().map(db::StoredRow::to_record).collect())
}

/// Last-write-wins upsert of one row. Returns the row the server holds
/// afterwards, which is newer than `record` when another write won.
pub async fn handle_upsert(
    pool: &db::Pool,
    feeds: &FeedHub,
    table: &str,
    id: &str,
    record: Record,
) -> Result<Record> {
    if record.id != id {
        return Err(AppError::BadRequest(format!(
            "row id {} does not match path id {id}",
            record.id
        )));
    }

    let mut tx = pool.begin().await?;
    db::lock_table(&mut tx, table).await?;
    let (stored, changed) = db::upsert_row(&mut *tx, table, &record).await?;
    tx.commit().await?;

    if changed {
        feeds.publish(table);
    }
    tracing::debug!(table = %table, record_id = %id, changed, "row upserted");
    Ok(stored.to_record())
}
