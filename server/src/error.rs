//! Unified error handling for the server.
//!
//! Every error body has the shape of `cadence_engine::backend::ErrorBody`,
//! and the status code is what the engine classifies failures by.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cadence_engine::backend::ErrorBody;
use cadence_engine::BackendErrorKind;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A procedure refused to run; nothing was written.
    #[error("{message}")]
    Rejected {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("Unauthorized")]
    Unauthorized,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Rejected {
            kind: BackendErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        AppError::Rejected {
            kind: BackendErrorKind::Constraint,
            message: message.into(),
        }
    }
}

/// Status and kind for a PostgreSQL error code, if it is the client's fault.
fn classify_database_code(code: &str) -> Option<(StatusCode, BackendErrorKind)> {
    match code {
        // unique_violation
        "23505" => Some((StatusCode::CONFLICT, BackendErrorKind::Constraint)),
        // foreign_key_violation, check_violation, not_null_violation
        "23503" | "23514" | "23502" => Some((
            StatusCode::UNPROCESSABLE_ENTITY,
            BackendErrorKind::Validation,
        )),
        // invalid_text_representation, numeric_value_out_of_range
        "22P02" | "22003" => Some((StatusCode::BAD_REQUEST, BackendErrorKind::Validation)),
        _ => None,
    }
}

fn status_of(kind: BackendErrorKind) -> StatusCode {
    match kind {
        BackendErrorKind::Constraint => StatusCode::CONFLICT,
        BackendErrorKind::Authorization => StatusCode::UNAUTHORIZED,
        BackendErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        BackendErrorKind::Network | BackendErrorKind::Unavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BackendErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            AppError::Database(e) => {
                let client_fault = e
                    .as_database_error()
                    .and_then(|db| db.code())
                    .and_then(|code| classify_database_code(&code));
                match client_fault {
                    Some((status, kind)) => {
                        tracing::debug!(error = %e, "rejected by database constraint");
                        (status, Some(kind), e.to_string())
                    }
                    None => {
                        tracing::error!("Database error: {:?}", e);
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            Some(BackendErrorKind::Unavailable),
                            "Database error".to_string(),
                        )
                    }
                }
            }
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Some(BackendErrorKind::Validation),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Some(BackendErrorKind::Validation),
                msg.clone(),
            ),
            AppError::Rejected { kind, message } => (status_of(*kind), Some(*kind), message.clone()),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Some(BackendErrorKind::Authorization),
                "Unauthorized".to_string(),
            ),
        };

        let body = Json(ErrorBody {
            error: message,
            kind,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
