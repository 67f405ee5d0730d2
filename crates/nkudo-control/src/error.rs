//! API error type for the control plane.
//!
//! Maps domain failures onto HTTP responses with a JSON
//! `{error, message}` body. Storage errors are classified here, at the
//! repository boundary: unique violations become `conflict`, missing
//! rows become `not_found`, connection-level failures become the
//! retriable `unavailable`. Internal detail is logged, never leaked.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Control-plane API error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Caller-supplied data invalid (validation, bad CSR, malformed JSON).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials (admin token, client cert, enrollment token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Cross-tenant access or revoked agent.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness or idempotency collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// State-machine transition forbidden.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transient storage or downstream failure; safe to retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Programmer error or unexpected condition.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    /// Stable short code surfaced to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_input",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) | Self::InvalidState(msg) => (StatusCode::CONFLICT, msg),
            Self::Unavailable(msg) => {
                tracing::warn!(error = %msg, "storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "temporarily unavailable, retry".to_owned(),
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: code,
            message,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".to_owned()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict("resource already exists".to_owned())
                } else if db_err.code().as_deref() == Some("40001") {
                    // serialization_failure — caller may retry
                    Self::Unavailable("serialization conflict".to_owned())
                } else {
                    Self::Internal(format!("database error: {db_err}"))
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::Unavailable(format!("database unreachable: {err}"))
            }
            _ => Self::Internal(format!("database error: {err}")),
        }
    }
}

impl From<nkudo_core::error::PkiError> for ApiError {
    fn from(err: nkudo_core::error::PkiError) -> Self {
        use nkudo_core::error::PkiError;
        match err {
            PkiError::BadCsr { .. } | PkiError::KeyTooWeak { .. } => {
                Self::BadRequest(err.to_string())
            }
            PkiError::Unavailable { .. } => Self::Unavailable(err.to_string()),
            PkiError::Verification(v) => Self::Unauthorized(v.to_string()),
            PkiError::CertGeneration { .. } | PkiError::Internal { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_classification() {
        let e: ApiError = sqlx::Error::RowNotFound.into();
        assert_eq!(e.code(), "not_found");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::BadRequest(String::new()).code(), "bad_input");
        assert_eq!(ApiError::Unavailable(String::new()).code(), "unavailable");
        assert_eq!(ApiError::InvalidState(String::new()).code(), "invalid_state");
    }
}
