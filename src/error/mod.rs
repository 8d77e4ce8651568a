//! Error taxonomy for wallet authentication
//!
//! Every failure that crosses a boundary (HTTP response, client call, wallet
//! interaction) is reported as exactly one [`ErrorCode`]. The code fixes the
//! HTTP status, the retry policy and the message shown to the user, so the
//! server and the client agree on what a failure means.

use std::fmt;
use std::str::FromStr;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a caller may react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// The request is wrong; repeating it cannot succeed
    Never,
    /// Transient; retry with backoff
    Backoff,
    /// Retry only once the block has been lifted
    AfterCooldown,
    /// The server may retry internally; the client must not
    ServerOnly,
    /// The user has to reconnect their wallet
    Reconnect,
}

/// Canonical error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    WalletAddressInvalid,
    SignatureInvalid,
    SignatureExpired,
    NonceInvalid,
    SessionCreationFailed,
    SessionExpired,
    RateLimitExceeded,
    UserCreationFailed,
    DatabaseError,
    InvalidRequest,
    InternalServerError,
    AuthenticationRequired,
    UserRejected,
    WalletNotInstalled,
    WalletTimeout,
    NetworkError,
    RequestTimeout,
    ServerUnavailable,
}

/// One row of the taxonomy table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorSpec {
    pub code: &'static str,
    pub status: u16,
    pub retry: RetryPolicy,
    pub message: &'static str,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 18] = [
        ErrorCode::WalletAddressInvalid,
        ErrorCode::SignatureInvalid,
        ErrorCode::SignatureExpired,
        ErrorCode::NonceInvalid,
        ErrorCode::SessionCreationFailed,
        ErrorCode::SessionExpired,
        ErrorCode::RateLimitExceeded,
        ErrorCode::UserCreationFailed,
        ErrorCode::DatabaseError,
        ErrorCode::InvalidRequest,
        ErrorCode::InternalServerError,
        ErrorCode::AuthenticationRequired,
        ErrorCode::UserRejected,
        ErrorCode::WalletNotInstalled,
        ErrorCode::WalletTimeout,
        ErrorCode::NetworkError,
        ErrorCode::RequestTimeout,
        ErrorCode::ServerUnavailable,
    ];

    /// Look up the taxonomy entry for this code
    pub fn spec(self) -> ErrorSpec {
        use RetryPolicy::*;
        let (code, status, retry, message) = match self {
            ErrorCode::WalletAddressInvalid => (
                "WALLET_ADDRESS_INVALID",
                400,
                Never,
                "The wallet address is not valid.",
            ),
            ErrorCode::SignatureInvalid => (
                "SIGNATURE_INVALID",
                401,
                Never,
                "The signature could not be verified.",
            ),
            ErrorCode::SignatureExpired => (
                "SIGNATURE_EXPIRED",
                401,
                Never,
                "The signed message has expired. Please sign again.",
            ),
            ErrorCode::NonceInvalid => (
                "NONCE_INVALID",
                401,
                Never,
                "The login challenge is invalid or was already used.",
            ),
            ErrorCode::SessionCreationFailed => (
                "SESSION_CREATION_FAILED",
                500,
                ServerOnly,
                "Your wallet was verified but a session could not be created.",
            ),
            ErrorCode::SessionExpired => (
                "SESSION_EXPIRED",
                401,
                Reconnect,
                "Your session has expired. Please reconnect your wallet.",
            ),
            ErrorCode::RateLimitExceeded => (
                "RATE_LIMIT_EXCEEDED",
                429,
                AfterCooldown,
                "Too many attempts. Please try again later.",
            ),
            ErrorCode::UserCreationFailed => (
                "USER_CREATION_FAILED",
                500,
                Backoff,
                "Your account could not be created. Please try again.",
            ),
            ErrorCode::DatabaseError => (
                "DATABASE_ERROR",
                500,
                Backoff,
                "A storage error occurred. Please try again.",
            ),
            ErrorCode::InvalidRequest => (
                "INVALID_REQUEST",
                400,
                Never,
                "The request is malformed.",
            ),
            ErrorCode::InternalServerError => (
                "INTERNAL_SERVER_ERROR",
                500,
                Backoff,
                "An unexpected error occurred.",
            ),
            ErrorCode::AuthenticationRequired => (
                "AUTHENTICATION_REQUIRED",
                401,
                Never,
                "Please sign in to continue.",
            ),
            ErrorCode::UserRejected => (
                "USER_REJECTED",
                400,
                Never,
                "The request was cancelled in your wallet.",
            ),
            ErrorCode::WalletNotInstalled => (
                "WALLET_NOT_INSTALLED",
                404,
                Never,
                "No wallet was found. Please install a wallet.",
            ),
            ErrorCode::WalletTimeout => (
                "WALLET_TIMEOUT",
                408,
                Backoff,
                "The wallet did not respond in time.",
            ),
            ErrorCode::NetworkError => (
                "NETWORK_ERROR",
                503,
                Backoff,
                "Network error. Please check your connection.",
            ),
            ErrorCode::RequestTimeout => (
                "REQUEST_TIMEOUT",
                504,
                Backoff,
                "The request timed out.",
            ),
            ErrorCode::ServerUnavailable => (
                "SERVER_UNAVAILABLE",
                503,
                Never,
                "The server is unavailable. Please try again later.",
            ),
        };
        ErrorSpec {
            code,
            status,
            retry,
            message,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.spec().code
    }

    pub fn status_code(self) -> StatusCode {
        StatusCode::from_u16(self.spec().status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn retry_policy(self) -> RetryPolicy {
        self.spec().retry
    }

    pub fn user_message(self) -> &'static str {
        self.spec().message
    }

    /// Whether a client may try the same call again
    pub fn is_retryable(self) -> bool {
        matches!(
            self.retry_policy(),
            RetryPolicy::Backoff | RetryPolicy::AfterCooldown
        )
    }

    /// User-initiated cancellation, not a failure
    pub fn is_cancellation(self) -> bool {
        matches!(self, ErrorCode::UserRejected)
    }

    pub fn is_server_error(self) -> bool {
        self.spec().status >= 500
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

/// A classified failure
#[derive(Error, Debug, Clone, PartialEq)]
pub struct AuthError {
    pub code: ErrorCode,
    pub detail: Option<String>,
    pub block_until: Option<DateTime<Utc>>,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.code, detail),
            None => write!(f, "{}: {}", self.code, self.code.user_message()),
        }
    }
}

impl AuthError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            detail: None,
            block_until: None,
        }
    }

    pub fn with_detail(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
            block_until: None,
        }
    }

    pub fn rate_limited(block_until: DateTime<Utc>) -> Self {
        Self {
            code: ErrorCode::RateLimitExceeded,
            detail: None,
            block_until: Some(block_until),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Client-visible body; internal detail is withheld on server errors
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let details = if self.code.is_server_error() {
            None
        } else {
            self.detail.clone()
        };
        ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.code.user_message().to_string(),
                retryable: self.code.is_retryable(),
                details,
            },
            block_until: self.block_until,
        }
    }
}

impl From<ErrorCode> for AuthError {
    fn from(code: ErrorCode) -> Self {
        AuthError::new(code)
    }
}

/// Failure envelope shared by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    #[serde(
        rename = "blockUntil",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<ErrorEnvelope> for AuthError {
    fn from(envelope: ErrorEnvelope) -> Self {
        let code = envelope
            .error
            .code
            .parse()
            .unwrap_or(ErrorCode::InternalServerError);
        AuthError {
            code,
            detail: envelope.error.details,
            block_until: envelope.block_until,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.code.is_server_error() {
            tracing::error!(code = %self.code, detail = ?self.detail, "Server error occurred");
        } else {
            tracing::debug!(code = %self.code, detail = ?self.detail, "Client error occurred");
        }

        let mut response = (status, Json(self.to_envelope())).into_response();

        if let Some(block_until) = self.block_until {
            let wait = (block_until - Utc::now()).num_seconds().max(1);
            if let Ok(value) = HeaderValue::from_str(&wait.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(err: validator::ValidationErrors) -> Self {
        AuthError::with_detail(ErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::with_detail(ErrorCode::InvalidRequest, format!("Invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::RequestTimeout
        } else if err.is_connect() || err.is_request() {
            ErrorCode::NetworkError
        } else if err.is_decode() {
            ErrorCode::InvalidRequest
        } else {
            ErrorCode::InternalServerError
        };
        AuthError::with_detail(code, err.to_string())
    }
}

/// Result type alias using AuthError
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_taxonomy_statuses() {
        assert_eq!(ErrorCode::WalletAddressInvalid.spec().status, 400);
        assert_eq!(ErrorCode::SignatureInvalid.spec().status, 401);
        assert_eq!(ErrorCode::SignatureExpired.spec().status, 401);
        assert_eq!(ErrorCode::NonceInvalid.spec().status, 401);
        assert_eq!(ErrorCode::SessionCreationFailed.spec().status, 500);
        assert_eq!(ErrorCode::SessionExpired.spec().status, 401);
        assert_eq!(ErrorCode::RateLimitExceeded.spec().status, 429);
        assert_eq!(ErrorCode::UserCreationFailed.spec().status, 500);
        assert_eq!(ErrorCode::DatabaseError.spec().status, 500);
    }

    #[test]
    fn test_retry_policies() {
        assert!(!ErrorCode::SignatureInvalid.is_retryable());
        assert!(!ErrorCode::NonceInvalid.is_retryable());
        assert!(!ErrorCode::SessionCreationFailed.is_retryable());
        assert_eq!(
            ErrorCode::SessionCreationFailed.retry_policy(),
            RetryPolicy::ServerOnly
        );
        assert_eq!(
            ErrorCode::SessionExpired.retry_policy(),
            RetryPolicy::Reconnect
        );
        assert!(ErrorCode::RateLimitExceeded.is_retryable());
        assert!(ErrorCode::UserCreationFailed.is_retryable());
        assert!(ErrorCode::DatabaseError.is_retryable());
        assert!(ErrorCode::UserRejected.is_cancellation());
        assert!(!ErrorCode::UserRejected.is_retryable());
    }

    #[test]
    fn test_codes_parse_back() {
        for code in ErrorCode::ALL {
            assert_eq!(code.as_str().parse::<ErrorCode>().unwrap(), code);
        }
        assert!("NOT_A_CODE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_envelope_hides_server_detail() {
        let err = AuthError::with_detail(ErrorCode::DatabaseError, "connection refused");
        let envelope = err.to_envelope();
        assert_eq!(envelope.error.code, "DATABASE_ERROR");
        assert!(envelope.error.details.is_none());

        let err = AuthError::with_detail(ErrorCode::InvalidRequest, "missing signature");
        assert_eq!(
            err.to_envelope().error.details.as_deref(),
            Some("missing signature")
        );
    }

    #[test]
    fn test_rate_limited_envelope_round_trip() {
        let until = Utc::now() + Duration::hours(1);
        let err = AuthError::rate_limited(until);
        let json = serde_json::to_value(err.to_envelope()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert!(json["blockUntil"].is_string());

        let parsed: ErrorEnvelope = serde_json::from_value(json).unwrap();
        let back = AuthError::from(parsed);
        assert_eq!(back.code, ErrorCode::RateLimitExceeded);
        assert_eq!(back.block_until, Some(until));
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let err = AuthError::rate_limited(Utc::now() + Duration::minutes(10));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
