//! Row and change-feed routes.

use axum::{
    extract::{Path, State},
    routing::{post, put},
    Json, Router,
};
use cadence_engine::backend::{ChangesRequest, ChangesResponse, SnapshotQuery};
use cadence_engine::Record;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_changes, handle_query, handle_upsert, validate_table_name};
use crate::AppState;

/// Create table routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tables/{table}/query", post(query_handler))
        .route("/tables/{table}/rows/{id}", put(upsert_handler))
        .route("/tables/{table}/changes", post(changes_handler))
}

/// POST /tables/{table}/query - Snapshot query.
async fn query_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    Json(query): Json<SnapshotQuery>,
) -> Result<Json<Vec<Record>>> {
    validate_table_name(&table)?;
    let rows = handle_query(&state.pool, &table, query).await?;
    Ok(Json(rows))
}

/// PUT /tables/{table}/rows/{id} - Last-write-wins upsert.
async fn upsert_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((table, id)): Path<(String, String)>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    validate_table_name(&table)?;
    let stored = handle_upsert(&state.pool, &state.feeds, &table, &id, record).await?;
    Ok(Json(stored))
}

/// POST /tables/{table}/changes - Long-poll the change feed.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(table): Path<String>,
    Json(request): Json<ChangesRequest>,
) -> Result<Json<ChangesResponse>> {
    validate_table_name(&table)?;
    let response = handle_changes(
        &state.pool,
        &state.feeds,
        state.config.max_feed_wait,
        &table,
        request,
    )
    .await?;
    Ok(Json(response))
}
