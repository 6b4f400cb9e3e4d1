//! Request handlers for the backend contract.

mod changes;
mod rows;
mod rpc;

pub use changes::*;
pub use rows::*;
pub use rpc::*;

use crate::error::{AppError, Result};

/// Table names are lowercase identifiers, like the collections that map to
/// them.
pub fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("invalid table name: {table}")))
    }
}

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
