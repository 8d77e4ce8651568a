//! Authentication HTTP handlers
//!
//! Endpoints for wallet-based authentication.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    Json,
};
use chrono::Utc;
use validator::Validate;

use crate::app_state::AppState;
use crate::error::{AuthError, ErrorCode};
use crate::middleware::{AuthenticatedWallet, ClientInfo};
use crate::models::{
    AuthMethod, GrantType, NonceRequest, NonceResponse, RefreshTokenRequest, TokenQuery,
    TokenResponse, VerifyEnvelope, VerifyRequest, WalletProfile,
};

/// Unwrap and validate a JSON body, keeping the error envelope on rejection
fn validated<T: Validate>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AuthError> {
    let Json(body) = payload
        .map_err(|e| AuthError::with_detail(ErrorCode::InvalidRequest, e.body_text()))?;
    body.validate()?;
    Ok(body)
}

/// POST /auth/nonce - Issue a single-use nonce for a wallet address
pub async fn request_nonce(
    State(state): State<AppState>,
    client: ClientInfo,
    payload: Result<Json<NonceRequest>, JsonRejection>,
) -> Result<Json<NonceResponse>, AuthError> {
    let ctx = client.context("/auth/nonce");

    let req = match validated(payload) {
        Ok(req) => req,
        Err(e) => {
            state.monitor.record_auth_failure(&ctx, &e, None).await;
            return Err(e);
        }
    };

    match state.auth_service.issue_nonce(&req.address).await {
        Ok(record) => {
            let policy = state.auth_service.policy();
            Ok(Json(NonceResponse {
                nonce: record.value,
                expires_at: Some(record.expires_at),
                domain: Some(policy.domain.clone()),
                uri: Some(policy.uri.clone()),
                statement: Some(policy.statement.clone()),
            }))
        }
        Err(e) => {
            state
                .monitor
                .record_auth_failure(&ctx, &e, Some(&req.address))
                .await;
            Err(e)
        }
    }
}

/// POST /auth/verify - Verify a signed challenge and issue a session
pub async fn verify_signature(
    State(state): State<AppState>,
    client: ClientInfo,
    payload: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyEnvelope>, AuthError> {
    let ctx = client.context("/auth/verify");

    let req = match validated(payload) {
        Ok(req) => req,
        Err(e) => {
            state.monitor.record_auth_failure(&ctx, &e, None).await;
            return Err(e);
        }
    };

    match state.auth_service.verify(&req).await {
        Ok(envelope) => Ok(Json(envelope)),
        Err(e) => {
            tracing::warn!(
                client = %client.ip,
                address = %req.wallet_address,
                code = e.code.as_str(),
                "Wallet verification failed"
            );
            state
                .monitor
                .record_auth_failure(&ctx, &e, Some(&req.wallet_address))
                .await;
            Err(e)
        }
    }
}

/// POST /auth/token?grant_type=refresh_token - Rotate a direct session
pub async fn token(
    State(state): State<AppState>,
    client: ClientInfo,
    query: Result<Query<TokenQuery>, QueryRejection>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let Query(query) = query
        .map_err(|e| AuthError::with_detail(ErrorCode::InvalidRequest, e.body_text()))?;

    if query.grant_type != GrantType::RefreshToken {
        return Err(AuthError::with_detail(
            ErrorCode::InvalidRequest,
            "Password grants are served by the identity store",
        ));
    }

    let req = validated(payload)?;
    match state
        .auth_service
        .refresh_tokens_at(&req.refresh_token, Utc::now())
    {
        Ok(tokens) => Ok(Json(tokens)),
        Err(e) => {
            state
                .monitor
                .record_auth_failure(&client.context("/auth/token"), &e, None)
                .await;
            Err(e)
        }
    }
}

/// GET /auth/me - Identity behind the bearer token
pub async fn me(wallet: AuthenticatedWallet) -> Json<WalletProfile> {
    Json(WalletProfile {
        user_id: wallet.user_id,
        wallet_address: wallet.wallet_address,
        auth_method: AuthMethod::Web3,
        session_expires_at: wallet.expires_at,
    })
}
