//! Session issuance
//!
//! After a wallet signature is verified the server materializes a session in
//! one of two shapes:
//! - direct: access/refresh JWTs minted here ([`JwtSessionIssuer`])
//! - transitional: virtual-email credentials provisioned at the identity
//!   store, which the client exchanges through a password login
//!   ([`TransitionalSessionIssuer`])

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AuthError, ErrorCode};
use crate::models::{
    DirectSession, SessionPayload, TokenResponse, TransitionalSession, UserResponse, WalletUser,
};

use super::jwt::{generate_access_token, generate_refresh_token, verify_token, Claims, JwtError};

/// Lifetime of transitional credentials
const TRANSITIONAL_SESSION_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Turns a verified wallet user into session credentials
#[async_trait]
pub trait SessionIssuer: Send + Sync {
    /// Issue a session. The returned user may carry fields filled in during
    /// issuance (e.g. the virtual email).
    async fn issue(
        &self,
        user: WalletUser,
        now: DateTime<Utc>,
    ) -> Result<(WalletUser, SessionPayload), AuthError>;
}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::TokenExpired => AuthError::with_detail(ErrorCode::SessionExpired, e.to_string()),
            JwtError::EncodingFailed(_) => {
                AuthError::with_detail(ErrorCode::SessionCreationFailed, e.to_string())
            }
            _ => AuthError::with_detail(ErrorCode::AuthenticationRequired, e.to_string()),
        }
    }
}

struct RefreshEntry {
    user: WalletUser,
    expires_at: DateTime<Utc>,
}

/// Mints, rotates and validates direct-session tokens.
///
/// Refresh tokens are single-use: each refresh revokes the presented token
/// and hands out a new pair. Only a SHA-256 hash of outstanding refresh
/// tokens is kept.
pub struct TokenService {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
    refresh_tokens: RwLock<HashMap<String, RefreshEntry>>,
}

impl TokenService {
    pub fn new(secret: impl Into<String>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            access_ttl,
            refresh_ttl,
            refresh_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a new access/refresh pair for `user`
    pub fn issue_pair(
        &self,
        user: &WalletUser,
        now: DateTime<Utc>,
    ) -> Result<DirectSession, AuthError> {
        let access_token = generate_access_token(
            user,
            &Uuid::new_v4().to_string(),
            &self.secret,
            self.access_ttl,
            now,
        )?;
        let refresh_token = generate_refresh_token(
            user,
            &Uuid::new_v4().to_string(),
            &self.secret,
            self.refresh_ttl,
            now,
        )?;

        let mut registry = self.refresh_tokens.write().map_err(|e| {
            AuthError::with_detail(ErrorCode::SessionCreationFailed, e.to_string())
        })?;
        registry.insert(
            hash_token(&refresh_token),
            RefreshEntry {
                user: user.clone(),
                expires_at: now + self.refresh_ttl,
            },
        );

        Ok(DirectSession {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_at: (now + self.access_ttl).timestamp(),
        })
    }

    /// Exchange a refresh token for a new pair
    pub fn refresh(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<(WalletUser, DirectSession), AuthError> {
        let claims = verify_token(refresh_token, &self.secret)?;
        if !claims.is_refresh() {
            return Err(AuthError::with_detail(
                ErrorCode::AuthenticationRequired,
                "Expected refresh token",
            ));
        }

        let entry = {
            let mut registry = self
                .refresh_tokens
                .write()
                .map_err(|e| AuthError::with_detail(ErrorCode::DatabaseError, e.to_string()))?;
            registry.remove(&hash_token(refresh_token))
        };

        let entry = match entry {
            Some(entry) if entry.expires_at > now => entry,
            _ => {
                return Err(AuthError::with_detail(
                    ErrorCode::SessionExpired,
                    "Refresh token revoked or already used",
                ))
            }
        };

        let session = self.issue_pair(&entry.user, now)?;
        Ok((entry.user, session))
    }

    /// Validate an access token presented as a bearer credential
    pub fn verify_access(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = verify_token(token, &self.secret)?;
        if !claims.is_access() {
            return Err(AuthError::with_detail(
                ErrorCode::AuthenticationRequired,
                "Expected access token",
            ));
        }
        Ok(claims)
    }

    /// Revoke an outstanding refresh token. Returns whether it was known.
    pub fn revoke(&self, refresh_token: &str) -> bool {
        self.refresh_tokens
            .write()
            .map(|mut registry| registry.remove(&hash_token(refresh_token)).is_some())
            .unwrap_or(false)
    }

    /// Drop expired refresh tokens
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        match self.refresh_tokens.write() {
            Ok(mut registry) => {
                let before = registry.len();
                registry.retain(|_, entry| entry.expires_at > now);
                before - registry.len()
            }
            Err(_) => 0,
        }
    }

    /// Shape a refreshed pair like an identity store token grant
    pub fn token_response(
        &self,
        user: WalletUser,
        session: DirectSession,
        now: DateTime<Utc>,
    ) -> TokenResponse {
        TokenResponse {
            access_token: session.access_token,
            refresh_token: session.refresh_token,
            token_type: session.token_type,
            expires_in: Some((session.expires_at - now.timestamp()).max(0)),
            expires_at: Some(session.expires_at),
            user: Some(UserResponse::from(user)),
        }
    }
}

/// Hash a token for storage
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Direct sessions: tokens minted by this server
pub struct JwtSessionIssuer {
    tokens: Arc<TokenService>,
}

impl JwtSessionIssuer {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl SessionIssuer for JwtSessionIssuer {
    async fn issue(
        &self,
        user: WalletUser,
        now: DateTime<Utc>,
    ) -> Result<(WalletUser, SessionPayload), AuthError> {
        let session = self.tokens.issue_pair(&user, now)?;
        Ok((user, SessionPayload::Direct(session)))
    }
}

/// Identity store admin failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityAdminError {
    #[error("Identity store unreachable: {0}")]
    Transport(String),

    #[error("Identity store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("User not found: {0}")]
    UserNotFound(String),
}

/// Admin side of the external identity store
#[async_trait]
pub trait IdentityAdmin: Send + Sync {
    /// Create the user for `email`, or reset its password if it exists
    async fn upsert_password_user(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<(), IdentityAdminError>;
}

/// Identity store admin API over HTTP.
///
/// - `POST   {base}/admin/users` creates a user; 409/422 means it exists
/// - `GET    {base}/admin/users?email=` looks a user up
/// - `PUT    {base}/admin/users/{id}` updates the password
pub struct HttpIdentityAdmin {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Deserialize)]
struct AdminUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct AdminUserList {
    users: Vec<AdminUser>,
}

impl HttpIdentityAdmin {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, IdentityAdminError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityAdminError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn find_user_id(&self, email: &str) -> Result<String, IdentityAdminError> {
        let response = self
            .authorized(self.client.get(format!("{}/admin/users", self.base_url)))
            .query(&[("email", email)])
            .send()
            .await
            .map_err(|e| IdentityAdminError::Transport(e.to_string()))?;

        let response = check_status(response).await?;
        let list: AdminUserList = response
            .json()
            .await
            .map_err(|e| IdentityAdminError::Transport(e.to_string()))?;

        list.users
            .into_iter()
            .find(|u| {
                u.email
                    .as_deref()
                    .map(|e| e.eq_ignore_ascii_case(email))
                    .unwrap_or(false)
            })
            .map(|u| u.id)
            .ok_or_else(|| IdentityAdminError::UserNotFound(email.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, IdentityAdminError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(IdentityAdminError::Rejected { status, body })
}

#[async_trait]
impl IdentityAdmin for HttpIdentityAdmin {
    async fn upsert_password_user(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<(), IdentityAdminError> {
        let response = self
            .authorized(self.client.post(format!("{}/admin/users", self.base_url)))
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "email_confirm": true,
                "user_metadata": metadata,
            }))
            .send()
            .await
            .map_err(|e| IdentityAdminError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status != StatusCode::CONFLICT && status != StatusCode::UNPROCESSABLE_ENTITY {
            return check_status(response).await.map(|_| ());
        }

        tracing::debug!(email = %email, "Identity exists, resetting password");
        let id = self.find_user_id(email).await?;
        let response = self
            .authorized(
                self.client
                    .put(format!("{}/admin/users/{}", self.base_url, id)),
            )
            .json(&serde_json::json!({
                "password": password,
                "user_metadata": metadata,
            }))
            .send()
            .await
            .map_err(|e| IdentityAdminError::Transport(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}

/// Transitional sessions: one-time credentials at the identity store
pub struct TransitionalSessionIssuer {
    admin: Arc<dyn IdentityAdmin>,
    email_domain: String,
}

impl TransitionalSessionIssuer {
    pub fn new(admin: Arc<dyn IdentityAdmin>, email_domain: impl Into<String>) -> Self {
        Self {
            admin,
            email_domain: email_domain.into(),
        }
    }

    /// Virtual email for a wallet address
    pub fn virtual_email(&self, address: &str) -> String {
        format!("w3_{}@{}", address.to_lowercase(), self.email_domain)
    }
}

#[async_trait]
impl SessionIssuer for TransitionalSessionIssuer {
    async fn issue(
        &self,
        user: WalletUser,
        now: DateTime<Utc>,
    ) -> Result<(WalletUser, SessionPayload), AuthError> {
        let email = self.virtual_email(&user.wallet_address);
        let password = Uuid::new_v4().to_string();
        let metadata = serde_json::json!({
            "wallet_address": user.wallet_address,
            "auth_method": "web3",
            "display_name": user.display_name,
        });

        self.admin
            .upsert_password_user(&email, &password, metadata)
            .await
            .map_err(|e| {
                tracing::error!(address = %user.wallet_address, error = %e, "Identity provisioning failed");
                AuthError::with_detail(ErrorCode::UserCreationFailed, e.to_string())
            })?;

        let session = TransitionalSession {
            email: email.clone(),
            password,
            web3_auth: true,
            expires_at: Some(now.timestamp() + TRANSITIONAL_SESSION_TTL_SECONDS),
            wallet_address: Some(user.wallet_address.clone()),
        };

        Ok((user.with_email(email), SessionPayload::Transitional(session)))
    }
}
