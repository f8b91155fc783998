//! Error envelope for the REST surface.
//!
//! Every failing route answers `{"error": {"code", "message",
//! "details"?}}` with the closed code set from `verdant_common::error`.
//! Locally-recovered outcomes (marketplace fallback, duplicate events)
//! never reach this envelope; they are 200s with tagged bodies.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use verdant_common::{CoreError, ErrorKind};
use verdant_auth::AuthError;
use verdant_pool::contribution::PoolError;
use verdant_retire::execution::ExecutionError;

/// Route-level error carrying a §7 kind.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Seconds the caller should wait, attached to 429s.
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: "rate limit exceeded".to_string(),
            details: None,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "code": self.kind.code(),
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError {
            kind: err.kind,
            message: err.message,
            details: err.details,
            retry_after_secs: None,
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let kind = match &err {
            PoolError::InvalidInput(_) => ErrorKind::InvalidRequest,
            PoolError::NotFound(_) => ErrorKind::NotFound,
            PoolError::Gateway(_) => ErrorKind::ServiceUnavailable,
            PoolError::Store(_) => ErrorKind::Internal,
        };
        ApiError::new(kind, err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match &err {
            AuthError::VerificationFailed {
                attempts_used,
                max_attempts,
                locked,
            } => ApiError::new(ErrorKind::VerificationFailed, err.to_string()).with_details(
                json!({
                    "attempts_used": attempts_used,
                    "max_attempts": max_attempts,
                    "locked": locked,
                }),
            ),
            AuthError::UnknownSession(_) | AuthError::NoVerifiedSession(_) => {
                ApiError::new(ErrorKind::NotFound, err.to_string())
            }
            AuthError::Store(_) => ApiError::new(ErrorKind::Internal, err.to_string()),
            _ => ApiError::new(ErrorKind::InvalidRequest, err.to_string()),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match &err {
            ExecutionError::AlreadyRunning { .. } => {
                ApiError::new(ErrorKind::InvalidRequest, err.to_string())
            }
            ExecutionError::Store(_) => ApiError::new(ErrorKind::Internal, err.to_string()),
        }
    }
}
