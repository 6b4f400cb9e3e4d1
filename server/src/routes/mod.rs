//! HTTP route definitions.

mod health;
mod rpc;
mod tables;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(tables::routes())
        .merge(rpc::routes())
}

/// Routes with tracing and CORS applied, bound to `state`.
pub fn build_router(state: AppState) -> Router {
    create_routes()
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
