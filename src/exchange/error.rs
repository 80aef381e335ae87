//! Error classification for the exchange API.
//!
//! The exchange reports failures either as HTTP status codes or as symbolic
//! error codes in the response body. Both map onto a closed taxonomy that
//! drives the retry policy: transient kinds are retried with backoff,
//! permanent kinds surface immediately so the caller can shrink the batch
//! or prune stale ids.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Session token rejected. Retried after a forced re-login.
    InvalidSession,
    /// Request would return too much data. Never retried; reduce batch size.
    TooMuchData,
    Timeout,
    RateLimited,
    /// HTTP 400 / invalid parameters. Never retried; prune stale ids.
    InvalidInput,
    ServiceUnavailable,
    Unknown,
}

impl ApiErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorKind::InvalidSession => "INVALID_SESSION",
            ApiErrorKind::TooMuchData => "TOO_MUCH_DATA",
            ApiErrorKind::Timeout => "TIMEOUT",
            ApiErrorKind::RateLimited => "RATE_LIMITED",
            ApiErrorKind::InvalidInput => "INVALID_INPUT",
            ApiErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ApiErrorKind::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn is_too_much_data(&self) -> bool {
        self.kind == ApiErrorKind::TooMuchData
    }

    pub fn is_invalid_input(&self) -> bool {
        self.kind == ApiErrorKind::InvalidInput
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

/// Map a symbolic error code from the response body onto (kind, retryable).
pub fn classify_error_code(code: &str) -> (ApiErrorKind, bool) {
    match code {
        "INVALID_SESSION_INFORMATION" | "NO_SESSION" => (ApiErrorKind::InvalidSession, true),
        "TOO_MUCH_DATA" => (ApiErrorKind::TooMuchData, false),
        "INVALID_INPUT_DATA" | "INVALID_APP_KEY" => (ApiErrorKind::InvalidInput, false),
        "SERVICE_BUSY" => (ApiErrorKind::ServiceUnavailable, true),
        "TIMEOUT_ERROR" => (ApiErrorKind::Timeout, true),
        _ => (ApiErrorKind::Unknown, false),
    }
}
