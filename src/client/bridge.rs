//! Session bridge
//!
//! A verify response carries either a direct session (tokens usable as-is)
//! or transitional credentials that must first be exchanged through a
//! password login at the identity store. The bridge resolves both shapes
//! into one [`VerifiedSession`] with a known expiry.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ErrorCode};
use crate::models::{
    DirectSession, SessionPayload, TransitionalSession, UserResponse, VerifyEnvelope,
};

use super::identity::IdentityStore;

/// Password login attempts for transitional credentials
const PASSWORD_LOGIN_ATTEMPTS: u32 = 3;
/// Delay before the second login attempt; doubles afterwards
const PASSWORD_LOGIN_BASE_DELAY: StdDuration = StdDuration::from_millis(200);

/// Where a session's tokens came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Direct,
    Transitional,
}

/// A wallet-backed session ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedSession {
    pub user: UserResponse,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub source: SessionSource,
}

pub struct SessionBridge {
    identity: Arc<dyn IdentityStore>,
}

impl SessionBridge {
    pub fn new(identity: Arc<dyn IdentityStore>) -> Self {
        Self { identity }
    }

    /// Normalize a successful verify response.
    ///
    /// Any failure to materialize a transitional session fails the whole
    /// attempt with `SESSION_CREATION_FAILED`.
    pub async fn materialize(
        &self,
        envelope: VerifyEnvelope,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSession, AuthError> {
        if !envelope.success {
            return Err(AuthError::with_detail(
                ErrorCode::SessionCreationFailed,
                "verify response not successful",
            ));
        }

        let user = envelope.data.user;
        match envelope.data.session {
            SessionPayload::Direct(session) => Self::from_direct(user, session),
            SessionPayload::Transitional(credentials) => {
                self.from_transitional(user, credentials, now).await
            }
        }
    }

    fn from_direct(
        user: UserResponse,
        session: DirectSession,
    ) -> Result<VerifiedSession, AuthError> {
        let expires_at = DateTime::from_timestamp(session.expires_at, 0).ok_or_else(|| {
            AuthError::with_detail(
                ErrorCode::SessionCreationFailed,
                "direct session has no valid expiry",
            )
        })?;
        Ok(VerifiedSession {
            user,
            access_token: session.access_token,
            refresh_token: Some(session.refresh_token),
            token_type: session.token_type,
            expires_at,
            source: SessionSource::Direct,
        })
    }

    async fn from_transitional(
        &self,
        mut user: UserResponse,
        credentials: TransitionalSession,
        now: DateTime<Utc>,
    ) -> Result<VerifiedSession, AuthError> {
        if !credentials.web3_auth {
            tracing::warn!(email = %credentials.email, "Transitional session not flagged as web3");
        }

        let mut delay = PASSWORD_LOGIN_BASE_DELAY;
        let mut attempt = 1;
        let tokens = loop {
            match self
                .identity
                .password_login(&credentials.email, &credentials.password)
                .await
            {
                Ok(tokens) => break tokens,
                Err(e) if attempt < PASSWORD_LOGIN_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "Password login failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(email = %credentials.email, error = %e, "Transitional session could not be materialized");
                    return Err(AuthError::with_detail(
                        ErrorCode::SessionCreationFailed,
                        format!("password login failed: {}", e.code),
                    ));
                }
            }
        };

        let expires_at = tokens.resolve_expiry(now).ok_or_else(|| {
            AuthError::with_detail(
                ErrorCode::SessionCreationFailed,
                "identity store session has no expiry",
            )
        })?;

        if user.email.is_none() {
            user.email = Some(credentials.email);
        }

        Ok(VerifiedSession {
            user,
            access_token: tokens.access_token,
            refresh_token: Some(tokens.refresh_token).filter(|t| !t.is_empty()),
            token_type: tokens.token_type,
            expires_at,
            source: SessionSource::Transitional,
        })
    }
}
