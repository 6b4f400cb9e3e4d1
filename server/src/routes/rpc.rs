//! Procedure routes.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde_json::Value;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::handle_call;
use crate::AppState;

/// Create procedure routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/rpc/{name}", post(call_handler))
}

/// POST /rpc/{name} - Run a procedure.
async fn call_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>> {
    let result = handle_call(&state.pool, &state.feeds, &name, params).await?;
    Ok(Json(result))
}
