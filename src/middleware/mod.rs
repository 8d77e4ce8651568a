//! Middleware for the wallet auth API
//!
//! Request tracing, rate limiting, security headers, security monitoring and
//! bearer authentication.

pub mod auth;
mod client_info;
pub mod rate_limiter;
mod security;
mod tracing;

pub use auth::AuthenticatedWallet;
pub use client_info::{identify_client, ClientInfo};
pub use rate_limiter::{
    rate_limit_layer, InMemoryRateLimitStore, IpWindow, RateLimitDecision, RateLimitStore,
    RateLimiter,
};
pub use security::{hsts_header, security_headers, security_monitor_layer};
pub use self::tracing::request_tracing;
