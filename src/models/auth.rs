//! Authentication request/response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{AuthMethod, UserResponse};

/// Request for a login nonce
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NonceRequest {
    #[validate(length(min = 1, max = 128))]
    pub address: String,
}

/// Issued nonce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceResponse {
    pub nonce: String,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Challenge fields the server will accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
}

/// Request to verify a signed challenge
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 512))]
    pub signature: String,
    #[validate(length(min = 1, max = 4096))]
    pub message: String,
}

/// Session credentials minted by this server, usable as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "bearer")]
    pub token_type: String,
    /// Unix seconds
    pub expires_at: i64,
}

fn bearer() -> String {
    "Bearer".to_string()
}

/// Credentials that must be exchanged at the identity store before use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionalSession {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub web3_auth: bool,
    /// Unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
}

/// The two session shapes a verify can return
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionPayload {
    Direct(DirectSession),
    Transitional(TransitionalSession),
}

impl SessionPayload {
    pub fn is_transitional(&self) -> bool {
        matches!(self, SessionPayload::Transitional(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyData {
    pub user: UserResponse,
    pub session: SessionPayload,
}

/// Successful verify response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEnvelope {
    pub success: bool,
    pub data: VerifyData,
}

impl VerifyEnvelope {
    pub fn ok(user: UserResponse, session: SessionPayload) -> Self {
        Self {
            success: true,
            data: VerifyData { user, session },
        }
    }
}

/// Grant type of a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    Password,
    RefreshToken,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenQuery {
    pub grant_type: GrantType,
}

/// Refresh token request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RefreshTokenRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// Password grant request (identity store contract)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordGrantRequest {
    pub email: String,
    pub password: String,
}

/// Token grant response, shaped like the identity store's
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "bearer")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserResponse>,
}

impl TokenResponse {
    /// Absolute expiry, from `expires_at` or `expires_in` relative to `now`
    pub fn resolve_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (self.expires_at, self.expires_in) {
            (Some(at), _) => DateTime::from_timestamp(at, 0),
            (None, Some(secs)) => Some(now + chrono::Duration::seconds(secs)),
            (None, None) => None,
        }
    }
}

/// Bearer holder as seen by `GET /auth/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletProfile {
    pub user_id: Uuid,
    pub wallet_address: String,
    pub auth_method: AuthMethod,
    /// Access token expiry, unix seconds
    pub session_expires_at: i64,
}

/// Wallet identity as reported by the active provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletIdentity {
    pub address: String,
    pub chain_id: u64,
    pub provider_name: String,
}
