//! Configuration management for the server.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Bearer token clients must present. Unset means development mode:
    /// any request is accepted.
    pub auth_secret: Option<String>,
    /// Upper bound of the database pool
    pub max_connections: u32,
    /// Longest a change-feed poll is held open, whatever the client asks
    pub max_feed_wait: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?;

        let auth_secret = lookup("AUTH_SECRET").filter(|s| !s.is_empty());

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("DB_MAX_CONNECTIONS", raw))?,
            None => 10,
        };

        let max_feed_wait = match lookup("FEED_MAX_WAIT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .map_err(|_| ConfigError::InvalidNumber("FEED_MAX_WAIT_MS", raw))?,
            ),
            None => Duration::from_secs(30),
        };

        Ok(Self {
            host,
            port,
            database_url,
            auth_secret,
            max_connections,
            max_feed_wait,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value: {1}")]
    InvalidNumber(&'static str, String),
}
