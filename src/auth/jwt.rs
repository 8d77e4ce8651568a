//! JWT token generation and validation
//!
//! Handles creation and verification of the access and refresh tokens that
//! make up a direct session.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::WalletUser;

/// JWT-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtError {
    #[error("Token encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Token decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Wallet address, lowercase
    pub wallet: String,
    /// How the subject authenticated
    pub amr: String,
    /// JWT ID
    pub jti: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Token type (access or refresh)
    pub token_type: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, JwtError> {
        Uuid::parse_str(&self.sub).map_err(|e| JwtError::InvalidToken(e.to_string()))
    }

    pub fn is_access(&self) -> bool {
        self.token_type == TokenType::Access.as_str()
    }

    pub fn is_refresh(&self) -> bool {
        self.token_type == TokenType::Refresh.as_str()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Token type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// Generate an access token for a wallet user
pub fn generate_access_token(
    user: &WalletUser,
    jti: &str,
    secret: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, JwtError> {
    generate_token(user, jti, secret, ttl, now, TokenType::Access)
}

/// Generate a refresh token for a wallet user
pub fn generate_refresh_token(
    user: &WalletUser,
    jti: &str,
    secret: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<String, JwtError> {
    generate_token(user, jti, secret, ttl, now, TokenType::Refresh)
}

fn generate_token(
    user: &WalletUser,
    jti: &str,
    secret: &str,
    ttl: Duration,
    now: DateTime<Utc>,
    token_type: TokenType,
) -> Result<String, JwtError> {
    let claims = Claims {
        sub: user.id.to_string(),
        wallet: user.wallet_address.clone(),
        amr: "web3".to_string(),
        jti: jti.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        token_type: token_type.as_str().to_string(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| JwtError::EncodingFailed(e.to_string()))
}

/// Verify and decode a JWT token
///
/// # Returns
/// * `Ok(Claims)` if the signature is valid and the token is unexpired
/// * `Err(JwtError::TokenExpired)` once `exp` has passed
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, JwtError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    validation.leeway = 0;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => JwtError::TokenExpired,
        _ => JwtError::DecodingFailed(e.to_string()),
    })?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_user() -> WalletUser {
        WalletUser::for_wallet("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", Utc::now())
    }

    #[test]
    fn test_generate_access_token() {
        let user = create_test_user();
        let jti = Uuid::new_v4().to_string();
        let secret = "test-secret-key";

        let token =
            generate_access_token(&user, &jti, secret, Duration::seconds(900), Utc::now()).unwrap();
        assert!(!token.is_empty());

        let claims = verify_token(&token, secret).unwrap();
        assert_eq!(claims.user_id().unwrap(), user.id);
        assert_eq!(claims.wallet, user.wallet_address);
        assert!(claims.is_access());
        assert_eq!(claims.amr, "web3");
    }

    #[test]
    fn test_generate_refresh_token() {
        let user = create_test_user();
        let jti = Uuid::new_v4().to_string();
        let secret = "test-secret-key";

        let token =
            generate_refresh_token(&user, &jti, secret, Duration::days(7), Utc::now()).unwrap();
        let claims = verify_token(&token, secret).unwrap();
        assert!(claims.is_refresh());
    }

    #[test]
    fn test_expired_token() {
        let user = create_test_user();
        let issued = Utc::now() - Duration::hours(2);
        let token =
            generate_access_token(&user, "jti", "secret", Duration::seconds(60), issued).unwrap();
        assert_eq!(verify_token(&token, "secret"), Err(JwtError::TokenExpired));
    }

    #[test]
    fn test_invalid_token() {
        let result = verify_token("invalid.token.here", "test-secret-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_secret() {
        let user = create_test_user();
        let token =
            generate_access_token(&user, "jti", "secret1", Duration::seconds(900), Utc::now())
                .unwrap();
        assert!(verify_token(&token, "secret2").is_err());
    }
}
