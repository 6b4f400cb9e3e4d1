//! Cadence Server - reference backend for the Cadence sync engine.
//!
//! Serves snapshot queries, last-write-wins row upserts, a long-poll change
//! feed per table and transactional procedures over HTTP. Every table lives
//! in one generic `rows` table in PostgreSQL.

mod auth;
mod config;
mod db;
mod error;
mod feed;
mod handlers;
mod routes;

use crate::config::Config;
use crate::db::Pool;
use crate::feed::FeedHub;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub feeds: Arc<FeedHub>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Cadence Server on {}:{}", config.host, config.port);

    let pool = db::create_pool(&config).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState {
        pool,
        config: Arc::new(config),
        feeds: FeedHub::new_shared(),
    };
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
