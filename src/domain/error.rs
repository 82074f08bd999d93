//! Error taxonomy shared across the execution engine
//!
//! Every failure that crosses a component boundary carries an [`ErrorCode`]
//! so that retry classification, HTTP mapping and checkpoint bookkeeping all
//! agree on what happened.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standardized error codes used across adapters, orchestrator and API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidManifest,
    ValidationFailed,
    InvalidRequest,

    // Auth
    Unauthorized,
    Forbidden,
    AuthFailed,

    // Not found
    StudyNotFound,
    JobNotFound,

    // Rate limiting / quota
    RateLimited,
    QuotaExceeded,

    // Transient system / network conditions
    NetworkError,
    Timeout,
    ServiceUnavailable,
    TemporaryFailure,
    SurfaceUnavailable,
    InvalidResponse,
    SessionExpired,
    SessionInvalid,
    ProxyError,

    // Content / anti-bot outcomes
    ContentBlocked,
    CaptchaRequired,

    // System
    InternalError,
    DatabaseError,
}

impl ErrorCode {
    /// Whether this kind is retried by default, before any per-study overrides.
    pub fn is_retryable_default(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::NetworkError
                | Self::Timeout
                | Self::ServiceUnavailable
                | Self::InvalidResponse
                | Self::SessionExpired
                | Self::TemporaryFailure
                | Self::ProxyError
                | Self::SurfaceUnavailable
        )
    }

    /// HTTP status used when this code crosses the API boundary.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidManifest | Self::ValidationFailed | Self::InvalidRequest => 400,
            Self::Unauthorized | Self::AuthFailed => 401,
            Self::Forbidden => 403,
            Self::StudyNotFound | Self::JobNotFound => 404,
            Self::RateLimited | Self::QuotaExceeded => 429,
            Self::TemporaryFailure
            | Self::Timeout
            | Self::SurfaceUnavailable
            | Self::ServiceUnavailable
            | Self::NetworkError => 503,
            Self::InternalError
            | Self::DatabaseError
            | Self::SessionInvalid
            | Self::SessionExpired
            | Self::InvalidResponse
            | Self::ProxyError
            | Self::ContentBlocked
            | Self::CaptchaRequired => 500,
        }
    }

    /// Wire spelling (`SCREAMING_SNAKE_CASE`), the same string serde produces.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidManifest => "INVALID_MANIFEST",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::AuthFailed => "AUTH_FAILED",
            Self::StudyNotFound => "STUDY_NOT_FOUND",
            Self::JobNotFound => "JOB_NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::TemporaryFailure => "TEMPORARY_FAILURE",
            Self::SurfaceUnavailable => "SURFACE_UNAVAILABLE",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionInvalid => "SESSION_INVALID",
            Self::ProxyError => "PROXY_ERROR",
            Self::ContentBlocked => "CONTENT_BLOCKED",
            Self::CaptchaRequired => "CAPTCHA_REQUIRED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
        }
    }

    /// Parse the wire spelling back into a code. Unknown strings map to
    /// `InternalError` so adapter bugs never crash the retry path.
    pub fn parse_lenient(value: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(value.to_string()))
            .unwrap_or(Self::InternalError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured engine error carried across component boundaries.
///
/// `retryable` reflects the taxonomy default at construction time; the retry
/// policy may still override it per study configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable_default(),
            user_message: None,
            details: None,
            cause: None,
        }
    }

    pub fn with_user_message(mut self, msg: impl Into<String>) -> Self {
        self.user_message = Some(msg.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Wrap an unexpected internal failure. Used whenever orchestrator code
    /// hits an error that has no adapter-provided classification.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl From<ErrorCode> for EngineError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_defaults_follow_taxonomy() {
        assert!(ErrorCode::RateLimited.is_retryable_default());
        assert!(ErrorCode::NetworkError.is_retryable_default());
        assert!(ErrorCode::Timeout.is_retryable_default());
        assert!(ErrorCode::SessionExpired.is_retryable_default());

        assert!(!ErrorCode::AuthFailed.is_retryable_default());
        assert!(!ErrorCode::QuotaExceeded.is_retryable_default());
        assert!(!ErrorCode::InvalidRequest.is_retryable_default());
        assert!(!ErrorCode::ContentBlocked.is_retryable_default());
        assert!(!ErrorCode::CaptchaRequired.is_retryable_default());
    }

    #[test]
    fn http_mapping_matches_api_boundary() {
        assert_eq!(ErrorCode::InvalidManifest.http_status(), 400);
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::Forbidden.http_status(), 403);
        assert_eq!(ErrorCode::StudyNotFound.http_status(), 404);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::QuotaExceeded.http_status(), 429);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
        assert_eq!(ErrorCode::Timeout.http_status(), 503);
        assert_eq!(ErrorCode::SurfaceUnavailable.http_status(), 503);
    }

    #[test]
    fn wire_spelling_round_trips() {
        for code in [
            ErrorCode::RateLimited,
            ErrorCode::AuthFailed,
            ErrorCode::CaptchaRequired,
            ErrorCode::InternalError,
        ] {
            assert_eq!(ErrorCode::parse_lenient(code.as_str()), code);
        }
        assert_eq!(
            ErrorCode::parse_lenient("SOMETHING_NOBODY_SENDS"),
            ErrorCode::InternalError
        );
    }
}
