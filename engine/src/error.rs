//! Error types for the Cadence engine.

use crate::backend::{BackendError, BackendErrorKind};
use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the Cadence engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("field '{0}' is managed by the sync engine and cannot be written")]
    ReservedField(String),

    // Store errors
    #[error("operation on deleted record: {0}")]
    OperationOnDeleted(RecordId),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Remote errors surfaced to the caller that issued a write
    #[error("write rejected by backend ({kind:?}): {message}")]
    Rejected {
        kind: BackendErrorKind,
        message: String,
    },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    // Lifecycle
    #[error("write confirmation was cancelled")]
    Cancelled,

    #[error("engine is signed out")]
    SignedOut,
}

impl Error {
    /// Build the caller-facing error for a permanently rejected mutation.
    pub fn rejected(err: &BackendError) -> Self {
        Error::Rejected {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
