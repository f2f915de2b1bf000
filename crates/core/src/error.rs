//! Unified error types for the sessionizer.
//!
//! Error codes:
//! - SESSION_001: Invalid argument (window, identifiers)
//! - SESSION_002: Expected record not found
//! - SESSION_003: Property blob could not be encoded or decoded
//! - SESSION_004: Collaborator store failure
//! - SESSION_005: Channel classification failure
//! - SESSION_006: Internal error

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Status reported to the batch driver for a user run or a project run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    /// Nothing to do.
    NotModified,
    /// Invalid window or missing identifiers. No state was mutated.
    BadRequest,
    InternalError,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotModified => "not_modified",
            Self::BadRequest => "bad_request",
            Self::InternalError => "internal_error",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::BadRequest | Self::InternalError)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the sessionizer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("malformed properties: {0}")]
    MalformedProperties(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("channel classification failed: {0}")]
    Classification(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedProperties(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn classification(msg: impl Into<String>) -> Self {
        Self::Classification(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "SESSION_001",
            Self::NotFound(_) => "SESSION_002",
            Self::Codec(_) | Self::MalformedProperties(_) => "SESSION_003",
            Self::Store(_) => "SESSION_004",
            Self::Classification(_) => "SESSION_005",
            Self::Internal(_) => "SESSION_006",
        }
    }

    /// Status surfaced to the batch driver when this error ends a run.
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::InvalidArgument(_) => RunStatus::BadRequest,
            _ => RunStatus::InternalError,
        }
    }

    /// Soft errors are logged and degraded instead of failing the run.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Classification(_))
    }
}
