//! Route definitions for the wallet auth API

mod auth;
mod security;

pub use auth::auth_routes;
pub use security::security_routes;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::app_state::AppState;
use crate::middleware;

/// Assemble the full application router
pub fn build_router(state: AppState) -> Router {
    let cors = configure_cors(state.config.cors_allowed_origins.as_deref());
    let monitor = state.monitor.clone();
    let production = state.config.environment.is_production();
    let trust_proxy_headers = state.config.trust_proxy_headers;

    let mut app = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(auth_routes(&state))
        .merge(security_routes())
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(axum::middleware::from_fn(move |req, next| {
            middleware::security_monitor_layer(monitor.clone())(req, next)
        }));

    if production {
        app = app.layer(axum::middleware::from_fn(middleware::hsts_header));
    }

    app.layer(axum::middleware::from_fn(middleware::request_tracing))
        .layer(axum::middleware::from_fn(move |req, next| {
            middleware::identify_client(trust_proxy_headers, req, next)
        }))
        .layer(cors)
}

async fn root() -> &'static str {
    "Wallet Auth Bridge"
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn configure_cors(allowed_origins: Option<&str>) -> CorsLayer {
    let allowed_origins = allowed_origins.unwrap_or_default().trim();

    if allowed_origins.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (permissive)");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([header::RETRY_AFTER])
}
