//! Long-poll change feed.

use std::time::Duration;

use cadence_engine::backend::{ChangesRequest, ChangesResponse};

use crate::db;
use crate::error::{AppError, Result};
use crate::feed::FeedHub;

/// Events returned by one poll when the request names no limit.
const DEFAULT_EVENTS: usize = 500;

fn event_limit(requested: Option<usize>) -> Result<i64> {
    let limit = requested.unwrap_or(DEFAULT_EVENTS);
    if limit == 0 || limit > db::MAX_PAGE_SIZE {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            db::MAX_PAGE_SIZE
        )));
    }
    Ok(limit as i64)
}

/// Return the changes of `table` after the request cursor, waiting up to
/// the requested time (capped at `max_wait`) for one to arrive.
///
/// Without a cursor the current head is returned, so a new subscriber only
/// sees changes from now on.
pub async fn handle_changes(
    pool: &db::Pool,
    feeds: &FeedHub,
    max_wait: Duration,
    table: &str,
    request: ChangesRequest,
) -> Result<ChangesResponse> {
    let limit = event_limit(request.limit)?;
    let Some(cursor) = request.cursor else {
        let head = db::head_seq(pool, table).await?;
        return Ok(ChangesResponse {
            events: Vec::new(),
            cursor: head,
        });
    };

    let wait = Duration::from_millis(request.wait_ms).min(max_wait);
    let deadline = tokio::time::Instant::now() + wait;
    let notify = feeds.notifier(table);

    loop {
        // Register before reading so a commit in between is not missed.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let rows = db::changes_since(pool, table, &request.filter, cursor, limit).await?;
        if let Some(last) = rows.last() {
            return Ok(ChangesResponse {
                cursor: last.change_seq,
                events: rows.iter().map(|row| row.to_event(table)).collect(),
            });
        }

        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return Ok(ChangesResponse {
                events: Vec::new(),
                cursor,
            });
        }
    }
}
