//! Client identification (IP and user agent)
//!
//! `identify_client` runs outermost and stores a [`ClientInfo`] in the request
//! extensions. Proxy headers are only honoured when the deployment says a
//! trusted proxy sets them; otherwise the socket peer is the client.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{header, request::Parts, Extensions, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::monitor::RequestContext;

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    /// Identify the caller from the socket peer, and from proxy headers
    /// when `trust_proxy_headers` is set
    pub fn resolve(headers: &HeaderMap, extensions: &Extensions, trust_proxy_headers: bool) -> Self {
        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let forwarded = if trust_proxy_headers {
            forwarded_ip(headers)
        } else {
            None
        };

        Self {
            ip: forwarded
                .or(peer)
                .unwrap_or_else(|| "unknown".to_string()),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    /// The caller identified by `identify_client`, or the socket peer when
    /// that layer did not run
    pub fn from_request<B>(request: &axum::http::Request<B>) -> Self {
        Self::from_parts(request.headers(), request.extensions())
    }

    fn from_parts(headers: &HeaderMap, extensions: &Extensions) -> Self {
        extensions
            .get::<ClientInfo>()
            .cloned()
            .unwrap_or_else(|| Self::resolve(headers, extensions, false))
    }

    pub fn context(&self, endpoint: &str) -> RequestContext {
        RequestContext {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = from_xff {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Resolve the caller once for every later layer and handler
pub async fn identify_client(trust_proxy_headers: bool, mut request: Request, next: Next) -> Response {
    let client = ClientInfo::resolve(request.headers(), request.extensions(), trust_proxy_headers);
    request.extensions_mut().insert(client);
    next.run(request).await
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_parts(&parts.headers, &parts.extensions))
    }
}
