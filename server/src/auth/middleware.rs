//! Authentication middleware.
//!
//! Clients present `Authorization: Bearer <token>`. When `AUTH_SECRET` is
//! configured the token must match it; without it the server runs in
//! development mode and accepts any request.

use axum::{extract::FromRequestParts, http::header::AUTHORIZATION, http::request::Parts};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" in development mode
    #[allow(dead_code)]
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        authenticate(header, state.config.auth_secret.as_deref())
    }
}

fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    let token = match header {
        Some(header) => header
            .strip_prefix("Bearer ")
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Unauthorized)?,
        None if secret.is_none() => {
            return Ok(AuthUser {
                token: "anonymous".to_string(),
            })
        }
        None => return Err(AppError::Unauthorized),
    };

    match secret {
        Some(secret) if secret != token => {
            tracing::debug!("rejected bearer token");
            Err(AppError::Unauthorized)
        }
        _ => Ok(AuthUser {
            token: token.to_string(),
        }),
    }
}
