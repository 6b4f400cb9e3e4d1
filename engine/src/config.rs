//! Engine configuration.

use crate::conflict::TieBreak;
use crate::queue::Backoff;
use std::env;
use std::time::Duration;

/// Where the backend lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Backend base endpoint, e.g. `https://sync.example.com`
    pub base_url: String,
    /// Bearer credential sent with every request
    pub access_token: String,
    pub request_timeout: Duration,
}

impl BackendConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("CADENCE_BACKEND_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingBackendUrl)?;

        let access_token = lookup("CADENCE_ACCESS_TOKEN")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingAccessToken)?;

        let request_timeout = match lookup("CADENCE_REQUEST_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .map_err(|_| ConfigError::InvalidRequestTimeout(raw))?,
            ),
            None => Duration::from_millis(15_000),
        };

        Ok(Self {
            base_url,
            access_token,
            request_timeout,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("CADENCE_BACKEND_URL environment variable is required")]
    MissingBackendUrl,

    #[error("CADENCE_ACCESS_TOKEN environment variable is required")]
    MissingAccessToken,

    #[error("invalid CADENCE_REQUEST_TIMEOUT_MS value: {0}")]
    InvalidRequestTimeout(String),
}

/// Tuning knobs of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Retry delay for pushes, pulls and feed reconnects
    pub backoff: Backoff,
    /// Rows per pull request
    pub pull_page_size: usize,
    pub tie_break: TieBreak,
    /// Subscribe to the live change feed after the initial pull
    pub live_feed: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            pull_page_size: 500,
            tie_break: TieBreak::default(),
            live_feed: true,
        }
    }
}
