//! Authentication middleware
//!
//! Extracts the wallet behind a bearer access token.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthService;
use crate::error::{AuthError, ErrorCode};

/// Wallet authenticated by an access token
///
/// ```rust,ignore
/// async fn protected_handler(wallet: AuthenticatedWallet) -> String {
///     format!("Hello, {}", wallet.wallet_address)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthenticatedWallet {
    pub user_id: Uuid,
    pub wallet_address: String,
    pub jti: String,
    pub expires_at: i64,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedWallet
where
    Arc<AuthService>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| {
                    AuthError::with_detail(
                        ErrorCode::AuthenticationRequired,
                        "Authorization header with Bearer token required",
                    )
                })?;

        let auth_service = Arc::<AuthService>::from_ref(state);
        let claims = auth_service.authenticate(bearer.token())?;

        let user_id = claims.user_id().map_err(|_| {
            AuthError::with_detail(ErrorCode::AuthenticationRequired, "Invalid subject in token")
        })?;

        Ok(AuthenticatedWallet {
            user_id,
            wallet_address: claims.wallet,
            jti: claims.jti,
            expires_at: claims.exp,
        })
    }
}
