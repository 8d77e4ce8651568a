//! Authentication routes

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::app_state::AppState;
use crate::handlers::auth;
use crate::middleware::rate_limit_layer;

/// Create authentication routes
///
/// Nonce, verify and token grants are rate limited per IP; `/auth/me` is not.
pub fn auth_routes(state: &AppState) -> Router<AppState> {
    let rate_limiter = state.rate_limiter.clone();
    let monitor = state.monitor.clone();

    let guarded = Router::new()
        .route("/auth/nonce", post(auth::request_nonce))
        .route("/auth/verify", post(auth::verify_signature))
        .route("/auth/token", post(auth::token))
        .layer(axum::middleware::from_fn(move |req, next| {
            rate_limit_layer(rate_limiter.clone(), monitor.clone())(req, next)
        }));

    Router::new()
        .merge(guarded)
        .route("/auth/me", get(auth::me))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}
