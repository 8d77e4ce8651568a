//! Security headers and request monitoring middleware

use std::sync::Arc;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::monitor::SecurityMonitor;

use super::client_info::ClientInfo;

/// Middleware for adding security headers
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    // JSON API: nothing to load, nothing to frame
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        "Permissions-Policy",
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

/// Middleware for adding HSTS header (use only in production with HTTPS)
pub async fn hsts_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;

    response.headers_mut().insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );

    response
}

/// Feed every request through the security monitor.
///
/// Suspicious user agents and probe paths are recorded but still served;
/// 5xx responses are recorded as API errors.
pub fn security_monitor_layer(
    monitor: Arc<SecurityMonitor>,
) -> impl Fn(
    Request<Body>,
    Next,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
       + Send {
    move |request: Request<Body>, next: Next| {
        let monitor = monitor.clone();
        Box::pin(async move {
            let client = ClientInfo::from_request(&request);
            let path = request.uri().path().to_string();
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| path.clone());
            let ctx = client.context(&path);

            if let Some(severity) = monitor.inspect_request(&ctx, &path_and_query).await {
                tracing::warn!(
                    client = %client.ip,
                    path = %path,
                    severity = severity.as_str(),
                    "Suspicious request"
                );
            }

            let response = next.run(request).await;

            if response.status().is_server_error() {
                monitor
                    .record_api_error(&ctx, response.status().as_u16())
                    .await;
            }

            response
        })
    }
}
