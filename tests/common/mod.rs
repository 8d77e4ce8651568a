//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::str::FromStr;

use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use wallet_auth_bridge::app_state::AppState;
use wallet_auth_bridge::auth::ChallengeMessage;
use wallet_auth_bridge::config::Config;
use wallet_auth_bridge::routes::build_router;

pub const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const TEST_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";
pub const DOMAIN: &str = "app.test";

pub fn test_config() -> Config {
    Config {
        auth_domain: DOMAIN.to_string(),
        auth_uri: format!("https://{}", DOMAIN),
        cors_allowed_origins: Some("https://app.test".to_string()),
        // Requests carry their client IP in X-Forwarded-For
        trust_proxy_headers: true,
        ..Config::default()
    }
}

pub fn test_app() -> (AppState, Router) {
    let state = AppState::from_config(&test_config()).expect("test config is valid");
    let router = build_router(state.clone());
    (state, router)
}

pub fn signer() -> PrivateKeySigner {
    PrivateKeySigner::from_str(TEST_KEY).expect("valid test key")
}

pub fn post_json(path: &str, body: Value, ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", ip)
        .body(Body::from(body.to_string()))
        .expect("valid request")
}

pub fn get_with_bearer(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(path)
        .header("x-forwarded-for", "10.0.0.1");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).expect("valid request")
}

/// Send a request and decode the JSON body (`Value::Null` when empty)
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

/// Challenge text and signature for `nonce`
pub fn sign_challenge(
    signer: &PrivateKeySigner,
    domain: &str,
    nonce: &str,
    issued_at: DateTime<Utc>,
) -> (String, String) {
    let address = signer.address().to_string();
    let message = ChallengeMessage::new(domain, &address, 1, nonce, issued_at).build();
    let signature = signer
        .sign_message_sync(message.as_bytes())
        .expect("signing succeeds");
    (message, format!("0x{}", hex::encode(signature.as_bytes())))
}

pub fn verify_body(address: &str, message: &str, signature: &str) -> Value {
    json!({
        "walletAddress": address,
        "message": message,
        "signature": signature,
    })
}

/// Serve the router on an ephemeral port
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });
    addr
}
