//! Remote procedure calls.

use serde_json::Value;

use crate::db::{self, procedures::Procedure};
use crate::error::{AppError, Result};
use crate::feed::FeedHub;

/// Run procedure `name` in one transaction.
pub async fn handle_call(pool: &db::Pool, feeds: &FeedHub, name: &str, params: Value) -> Result<Value> {
    let procedure = Procedure::from_name(name)
        .ok_or_else(|| AppError::NotFound(format!("unknown procedure: {name}")))?;

    let mut tx = pool.begin().await?;
    let outcome = db::procedures::run(&mut tx, procedure, params, super::now_millis()).await?;
    tx.commit().await?;

    for table in &outcome.touched {
        feeds.publish(table);
    }
    tracing::debug!(procedure = %name, touched = ?outcome.touched, "procedure committed");
    Ok(outcome.result)
}
