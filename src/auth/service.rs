//! Authentication service
//!
//! Core business logic for wallet-based authentication: nonce issuance,
//! challenge verification and session issuance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::{AuthError, ErrorCode, RetryPolicy};
use crate::models::{TokenResponse, UserResponse, VerifyEnvelope, VerifyRequest, WalletUser};

use super::challenge::{ChallengeError, ChallengeMessage};
use super::crypto::{addresses_match, validate_wallet_address, verify_wallet_signature, CryptoError};
use super::jwt::Claims;
use super::nonce::{NonceError, NonceRecord, NonceService};
use super::session::{SessionIssuer, TokenService};

/// Tolerated clock difference between wallet and server
const CLOCK_SKEW_SECONDS: i64 = 60;

impl From<CryptoError> for AuthError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidAddressFormat(_)
            | CryptoError::InvalidChecksum
            | CryptoError::SuspiciousAddress(_) => {
                AuthError::with_detail(ErrorCode::WalletAddressInvalid, e.to_string())
            }
            _ => AuthError::with_detail(ErrorCode::SignatureInvalid, e.to_string()),
        }
    }
}

impl From<NonceError> for AuthError {
    fn from(e: NonceError) -> Self {
        match e {
            NonceError::Storage(_) => AuthError::with_detail(ErrorCode::DatabaseError, e.to_string()),
            _ => AuthError::with_detail(ErrorCode::NonceInvalid, e.to_string()),
        }
    }
}

impl From<ChallengeError> for AuthError {
    fn from(e: ChallengeError) -> Self {
        AuthError::with_detail(ErrorCode::InvalidRequest, e.to_string())
    }
}

/// What a challenge must look like to be accepted
#[derive(Debug, Clone)]
pub struct ChallengePolicy {
    pub domain: String,
    pub uri: String,
    pub statement: String,
    pub max_age: Duration,
}

/// Authentication service
#[derive(Clone)]
pub struct AuthService {
    nonces: Arc<NonceService>,
    issuer: Arc<dyn SessionIssuer>,
    tokens: Arc<TokenService>,
    policy: ChallengePolicy,
}

impl AuthService {
    pub fn new(
        nonces: Arc<NonceService>,
        issuer: Arc<dyn SessionIssuer>,
        tokens: Arc<TokenService>,
        policy: ChallengePolicy,
    ) -> Self {
        Self {
            nonces,
            issuer,
            tokens,
            policy,
        }
    }

    pub fn policy(&self) -> &ChallengePolicy {
        &self.policy
    }

    pub fn nonces(&self) -> &Arc<NonceService> {
        &self.nonces
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Issue a nonce for a wallet address
    pub async fn issue_nonce(&self, address: &str) -> Result<NonceRecord, AuthError> {
        self.issue_nonce_at(address, Utc::now()).await
    }

    pub async fn issue_nonce_at(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceRecord, AuthError> {
        let address = validate_wallet_address(address)?;
        let record = self.nonces.issue_at(&address, now).await?;
        tracing::debug!(address = %address, expires_at = %record.expires_at, "Issued nonce");
        Ok(record)
    }

    /// Verify a signed challenge and issue a session
    pub async fn verify(&self, req: &VerifyRequest) -> Result<VerifyEnvelope, AuthError> {
        self.verify_at(req, Utc::now()).await
    }

    pub async fn verify_at(
        &self,
        req: &VerifyRequest,
        now: DateTime<Utc>,
    ) -> Result<VerifyEnvelope, AuthError> {
        let address = validate_wallet_address(&req.wallet_address)?;
        let challenge = ChallengeMessage::parse(&req.message)?;

        if challenge.domain != self.policy.domain {
            return Err(AuthError::with_detail(
                ErrorCode::SignatureInvalid,
                format!("challenge issued for foreign domain '{}'", challenge.domain),
            ));
        }
        if !addresses_match(&challenge.address, &address) {
            return Err(AuthError::with_detail(
                ErrorCode::SignatureInvalid,
                "challenge address does not match wallet address",
            ));
        }

        // Each nonce gets exactly one attempt, whatever the outcome below.
        self.nonces
            .consume_at(&address, &challenge.nonce, now)
            .await?;

        if challenge.issued_at < now - self.policy.max_age {
            return Err(AuthError::with_detail(
                ErrorCode::SignatureExpired,
                format!("challenge issued at {}", challenge.issued_at),
            ));
        }
        if challenge.issued_at > now + Duration::seconds(CLOCK_SKEW_SECONDS) {
            return Err(AuthError::with_detail(
                ErrorCode::SignatureInvalid,
                "challenge issued in the future",
            ));
        }

        verify_wallet_signature(&address, &req.message, &req.signature)?;

        let user = WalletUser::for_wallet(&address, now);
        let (user, session) = self.issue_session(user, now).await?;

        tracing::info!(
            address = %address,
            chain_id = challenge.chain_id,
            transitional = session.is_transitional(),
            "Wallet authenticated"
        );

        Ok(VerifyEnvelope::ok(UserResponse::from(user), session))
    }

    /// Issue a session, retrying once when the failure is retryable server-side
    async fn issue_session(
        &self,
        user: WalletUser,
        now: DateTime<Utc>,
    ) -> Result<(WalletUser, crate::models::SessionPayload), AuthError> {
        match self.issuer.issue(user.clone(), now).await {
            Err(e) if e.code.retry_policy() == RetryPolicy::ServerOnly => {
                tracing::warn!(error = %e, "Session issuance failed, retrying once");
                self.issuer.issue(user, now).await
            }
            other => other,
        }
    }

    /// Exchange a refresh token for a new direct session
    pub fn refresh_tokens_at(
        &self,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenResponse, AuthError> {
        let (user, session) = self.tokens.refresh(refresh_token, now)?;
        tracing::debug!(address = %user.wallet_address, "Refreshed session");
        Ok(self.tokens.token_response(user, session, now))
    }

    /// Validate a bearer access token
    pub fn authenticate(&self, access_token: &str) -> Result<Claims, AuthError> {
        self.tokens.verify_access(access_token)
    }
}
