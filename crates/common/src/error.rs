//! Closed error-kind set shared by every service surface.
//!
//! The kinds map one-to-one onto the HTTP envelope codes emitted by the
//! API crate. Services deeper in the stack keep their own error enums and
//! convert at the boundary; `ErrorKind` is the only vocabulary the outer
//! surface speaks.

use thiserror::Error;

/// Closed set of error categories surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or semantically invalid request input.
    InvalidRequest,
    /// Missing or unrecognized credentials.
    Unauthorized,
    /// Addressed entity does not exist.
    NotFound,
    /// Caller exceeded its rate limit.
    RateLimited,
    /// Ledger or gateway outage; retryable upstream.
    ServiceUnavailable,
    /// Unclassified internal failure.
    Internal,
    /// Retirement failed and was translated into a marketplace link.
    RetirementFallback,
    /// Idempotent replay of an externally-keyed event.
    DuplicateEvent,
    /// Auth verification failed (attempts may remain).
    VerificationFailed,
}

impl ErrorKind {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::RetirementFallback => "RETIREMENT_FALLBACK",
            ErrorKind::DuplicateEvent => "DUPLICATE_EVENT",
            ErrorKind::VerificationFailed => "VERIFICATION_FAILED",
        }
    }

    /// HTTP status the kind is surfaced as.
    ///
    /// `RetirementFallback` and `DuplicateEvent` are recovered locally and
    /// answer 200 with a tagged body rather than an error status.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Internal => 500,
            ErrorKind::RetirementFallback => 200,
            ErrorKind::DuplicateEvent => 200,
            ErrorKind::VerificationFailed => 400,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A kind-tagged error carried across service boundaries.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured detail for `INVALID_REQUEST` / `VERIFICATION_FAILED`.
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
