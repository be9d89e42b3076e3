//! Error types for the data layer and their HTTP mapping.

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Errors surfaced by the entity stores and engines.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Requested id has no hash record.
    #[error("{0} not found")]
    NotFound(String),
    /// Empty or malformed input, rejected before any store access.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Write would break a uniqueness rule (email, duplicate interest).
    #[error("conflict: {0}")]
    Conflict(String),
    /// A record and its index disagree. Not repaired inline; see `Reconciler`.
    #[error("index inconsistency: {0}")]
    IndexInconsistency(String),
    /// A hash record exists but lacks fields required to decode it.
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    /// Transport or backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.into())
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Response-facing error for callers embedding the layer in an axum service.
pub enum AppError {
    /// Internal errors - logged but return generic 500 to user
    Internal(anyhow::Error),
    /// User-facing errors - message is safe to show
    External(StatusCode, &'static str),
    /// Validation errors - safe to show
    Validation(String),
    /// Caller exceeded a rate limit window.
    RateLimited { retry_after_secs: u64 },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                tracing::error!("internal error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Operation failed").into_response()
            }
            AppError::External(status, msg) => (status, msg).into_response(),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::RateLimited { retry_after_secs } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many requests. Try again later.",
                )
                    .into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs.max(1)),
                );
                response
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => AppError::External(StatusCode::NOT_FOUND, "Not found"),
            StoreError::Validation(msg) => AppError::Validation(msg),
            StoreError::Conflict(_) => AppError::External(StatusCode::CONFLICT, "Already exists"),
            StoreError::IndexInconsistency(_) | StoreError::Corrupt { .. } => {
                AppError::Internal(anyhow::anyhow!(err.to_string()))
            }
            StoreError::Backend(inner) => AppError::Internal(inner),
        }
    }
}
