//! Request tracing middleware

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use super::client_info::ClientInfo;

/// Log each request with its outcome and duration
pub async fn request_tracing(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client = ClientInfo::from_request(&request);
    let start = Instant::now();

    tracing::debug!(method = %method, path = %path, client_ip = %client.ip, "Request started");

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if response.status().is_server_error() {
        tracing::error!(method = %method, path = %path, client_ip = %client.ip, status, duration_ms, "Request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(method = %method, path = %path, client_ip = %client.ip, status, duration_ms, "Request rejected");
    } else {
        tracing::info!(method = %method, path = %path, client_ip = %client.ip, status, duration_ms, "Request completed");
    }

    response
}
