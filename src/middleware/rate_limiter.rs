//! Rate limiting for the authentication endpoints
//!
//! Per-IP sliding window over failed attempts. Once the window holds the
//! maximum, the next attempt is over the limit: it is rejected before it
//! reaches a handler, the IP is flagged as suspicious and blocked for a fixed
//! duration. The block is independent of the window, so it outlives the
//! attempts that caused it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::{body::Body, extract::Request, middleware::Next, response::{IntoResponse, Response}};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::AuthError;
use crate::monitor::SecurityMonitor;

use super::client_info::ClientInfo;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Blocked { block_until: DateTime<Utc> },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Attempt history of one IP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpWindow {
    pub attempts: VecDeque<DateTime<Utc>>,
    pub suspicious: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl IpWindow {
    fn active_block(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.blocked_until.filter(|until| *until > now)
    }

    fn prune(&mut self, now: DateTime<Utc>, policy: &RateLimitConfig) {
        let cutoff = now - policy.window();
        while self.attempts.front().is_some_and(|t| *t <= cutoff) {
            self.attempts.pop_front();
        }
    }

    fn remaining(&self, policy: &RateLimitConfig) -> u32 {
        policy
            .max_attempts
            .saturating_sub(self.attempts.len() as u32)
    }

    fn block(&mut self, now: DateTime<Utc>, policy: &RateLimitConfig) -> RateLimitDecision {
        let block_until = now + policy.block();
        self.suspicious = true;
        self.blocked_until = Some(block_until);
        RateLimitDecision::Blocked { block_until }
    }

    /// Admission check for a new attempt. A full window means this attempt
    /// is over the limit, so it is counted and the IP blocked.
    pub fn status(&mut self, now: DateTime<Utc>, policy: &RateLimitConfig) -> RateLimitDecision {
        if let Some(block_until) = self.active_block(now) {
            return RateLimitDecision::Blocked { block_until };
        }
        self.prune(now, policy);
        if self.attempts.len() as u32 >= policy.max_attempts {
            self.attempts.push_back(now);
            return self.block(now, policy);
        }
        RateLimitDecision::Allowed {
            remaining: self.remaining(policy),
        }
    }

    pub fn record(&mut self, now: DateTime<Utc>, policy: &RateLimitConfig) -> RateLimitDecision {
        if let Some(block_until) = self.active_block(now) {
            return RateLimitDecision::Blocked { block_until };
        }
        self.prune(now, policy);
        self.attempts.push_back(now);

        if self.attempts.len() as u32 > policy.max_attempts {
            return self.block(now, policy);
        }

        RateLimitDecision::Allowed {
            remaining: self.remaining(policy),
        }
    }

    /// Prune old attempts, lift the suspicious flag once no attempts remain
    /// and forget elapsed blocks. Returns whether the entry can be dropped.
    pub fn sweep(&mut self, now: DateTime<Utc>, policy: &RateLimitConfig) -> bool {
        self.prune(now, policy);
        if self.attempts.is_empty() {
            self.suspicious = false;
        }
        if self.active_block(now).is_none() {
            self.blocked_until = None;
        }
        self.attempts.is_empty() && !self.suspicious && self.blocked_until.is_none()
    }
}

#[derive(Error, Debug)]
pub enum RateLimitStoreError {
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Shared rate limit state. A multi-instance deployment needs an
/// implementation backed by a shared store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn status(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitStoreError>;

    async fn record(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitStoreError>;

    /// Returns the number of entries dropped
    async fn sweep(
        &self,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<usize, RateLimitStoreError>;

    /// Snapshot of one IP, for diagnostics
    async fn window(&self, ip: &str) -> Result<Option<IpWindow>, RateLimitStoreError>;
}

/// Per-process rate limit state
#[derive(Clone, Default)]
pub struct InMemoryRateLimitStore {
    windows: Arc<RwLock<HashMap<String, IpWindow>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn status(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        let mut windows = self
            .windows
            .write()
            .map_err(|e| RateLimitStoreError::LockPoisoned(e.to_string()))?;
        Ok(match windows.get_mut(ip) {
            Some(window) => window.status(now, policy),
            None => RateLimitDecision::Allowed {
                remaining: policy.max_attempts,
            },
        })
    }

    async fn record(
        &self,
        ip: &str,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        let mut windows = self
            .windows
            .write()
            .map_err(|e| RateLimitStoreError::LockPoisoned(e.to_string()))?;
        Ok(windows
            .entry(ip.to_string())
            .or_default()
            .record(now, policy))
    }

    async fn sweep(
        &self,
        now: DateTime<Utc>,
        policy: &RateLimitConfig,
    ) -> Result<usize, RateLimitStoreError> {
        let mut windows = self
            .windows
            .write()
            .map_err(|e| RateLimitStoreError::LockPoisoned(e.to_string()))?;
        let before = windows.len();
        windows.retain(|_, window| !window.sweep(now, policy));
        Ok(before - windows.len())
    }

    async fn window(&self, ip: &str) -> Result<Option<IpWindow>, RateLimitStoreError> {
        let windows = self
            .windows
            .read()
            .map_err(|e| RateLimitStoreError::LockPoisoned(e.to_string()))?;
        Ok(windows.get(ip).cloned())
    }
}

/// Rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policy: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: RateLimitConfig) -> Self {
        Self { store, policy }
    }

    pub fn in_memory(policy: RateLimitConfig) -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()), policy)
    }

    pub fn policy(&self) -> &RateLimitConfig {
        &self.policy
    }

    /// Admit or reject an attempt from `ip` before it runs. Only an attempt
    /// over the limit is counted here; store failures fail open.
    pub async fn check_at(&self, ip: &str, now: DateTime<Utc>) -> RateLimitDecision {
        self.store
            .status(ip, now, &self.policy)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, ip = %ip, "Rate limit store unavailable");
                RateLimitDecision::Allowed {
                    remaining: self.policy.max_attempts,
                }
            })
    }

    /// Count an attempt for `ip`
    pub async fn record_at(&self, ip: &str, now: DateTime<Utc>) -> RateLimitDecision {
        self.store
            .record(ip, now, &self.policy)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, ip = %ip, "Rate limit store unavailable");
                RateLimitDecision::Allowed {
                    remaining: self.policy.max_attempts,
                }
            })
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        match self.store.sweep(now, &self.policy).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "Rate limit sweep failed");
                0
            }
        }
    }

    pub async fn window(&self, ip: &str) -> Option<IpWindow> {
        self.store.window(ip).await.ok().flatten()
    }

    /// Start a background sweep task
    pub fn start_sweep_task(self: &Arc<Self>, shutdown: CancellationToken) {
        let limiter = Arc::clone(self);
        let interval = self.policy.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_at(Utc::now()).await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept rate limit entries");
                        }
                    }
                }
            }
        });
    }
}

/// Rate limiting middleware for the auth endpoints.
///
/// Blocked IPs, and IPs whose window is already full, get
/// `RATE_LIMIT_EXCEEDED` before the handler runs. Failed attempts (400/401
/// responses) are counted afterwards.
pub fn rate_limit_layer(
    rate_limiter: Arc<RateLimiter>,
    monitor: Arc<SecurityMonitor>,
) -> impl Fn(
    Request<Body>,
    Next,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone
       + Send {
    move |request: Request<Body>, next: Next| {
        let rate_limiter = rate_limiter.clone();
        let monitor = monitor.clone();
        Box::pin(async move {
            let client = ClientInfo::from_request(&request);
            let ctx = client.context(request.uri().path());

            if let RateLimitDecision::Blocked { block_until } =
                rate_limiter.check_at(&client.ip, Utc::now()).await
            {
                tracing::warn!(client = %client.ip, %block_until, "Rate limit exceeded");
                monitor.record_rate_limit(&ctx, block_until, false).await;
                return AuthError::rate_limited(block_until).into_response();
            }

            let response = next.run(request).await;

            let status = response.status().as_u16();
            if status == 400 || status == 401 {
                let decision = rate_limiter.record_at(&client.ip, Utc::now()).await;
                match decision {
                    RateLimitDecision::Blocked { block_until } => {
                        tracing::warn!(client = %client.ip, %block_until, "Client blocked after repeated failures");
                        monitor.record_rate_limit(&ctx, block_until, true).await;
                    }
                    RateLimitDecision::Allowed { remaining } => {
                        tracing::debug!(client = %client.ip, remaining, "Failed attempt recorded");
                    }
                }
            }

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::in_memory(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn test_sixth_attempt_in_window_rejected() {
        let limiter = limiter();
        let now = Utc::now();

        for i in 0..5 {
            let decision = limiter
                .record_at("1.2.3.4", now + Duration::seconds(i))
                .await;
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    remaining: 4 - i as u32
                }
            );
        }

        let sixth = now + Duration::seconds(5);
        assert_eq!(
            limiter.record_at("1.2.3.4", sixth).await,
            RateLimitDecision::Blocked {
                block_until: sixth + Duration::hours(1)
            }
        );
        assert!(limiter.window("1.2.3.4").await.unwrap().suspicious);
    }

    #[tokio::test]
    async fn test_full_window_blocks_next_attempt_up_front() {
        let limiter = limiter();
        let now = Utc::now();
        for i in 0..4 {
            limiter.record_at("1.2.3.4", now + Duration::seconds(i)).await;
        }
        assert_eq!(
            limiter.check_at("1.2.3.4", now).await,
            RateLimitDecision::Allowed { remaining: 1 }
        );
        limiter.record_at("1.2.3.4", now + Duration::seconds(4)).await;

        let sixth = now + Duration::seconds(5);
        assert_eq!(
            limiter.check_at("1.2.3.4", sixth).await,
            RateLimitDecision::Blocked {
                block_until: sixth + Duration::hours(1)
            }
        );
        let window = limiter.window("1.2.3.4").await.unwrap();
        assert!(window.suspicious);
        assert_eq!(window.attempts.len(), 6);

        // Later attempts keep the original block
        assert_eq!(
            limiter.check_at("1.2.3.4", sixth + Duration::minutes(1)).await,
            RateLimitDecision::Blocked {
                block_until: sixth + Duration::hours(1)
            }
        );
    }

    #[tokio::test]
    async fn test_counter_resets_after_window() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..5 {
            limiter.record_at("1.2.3.4", now).await;
        }
        assert_eq!(limiter.window("1.2.3.4").await.unwrap().attempts.len(), 5);

        let later = now + Duration::minutes(16);
        assert_eq!(
            limiter.check_at("1.2.3.4", later).await,
            RateLimitDecision::Allowed { remaining: 5 }
        );
        assert!(limiter.record_at("1.2.3.4", later).await.is_allowed());
    }

    #[tokio::test]
    async fn test_block_outlives_empty_window() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..6 {
            limiter.record_at("1.2.3.4", now).await;
        }

        // Window has elapsed and the sweep has emptied the attempt list
        let after_window = now + Duration::minutes(20);
        limiter.sweep_at(after_window).await;
        let window = limiter.window("1.2.3.4").await.unwrap();
        assert!(window.attempts.is_empty());
        assert!(!window.suspicious);

        assert_eq!(
            limiter.check_at("1.2.3.4", after_window).await,
            RateLimitDecision::Blocked {
                block_until: now + Duration::hours(1)
            }
        );

        let after_block = now + Duration::minutes(61);
        assert_eq!(
            limiter.check_at("1.2.3.4", after_block).await,
            RateLimitDecision::Allowed { remaining: 5 }
        );
        assert_eq!(limiter.sweep_at(after_block).await, 1);
        assert!(limiter.window("1.2.3.4").await.is_none());
    }

    #[tokio::test]
    async fn test_ips_are_independent() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..6 {
            limiter.record_at("client-a", now).await;
        }
        assert!(!limiter.check_at("client-a", now).await.is_allowed());
        assert!(limiter.check_at("client-b", now).await.is_allowed());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_entries() {
        let limiter = limiter();
        let now = Utc::now();
        limiter.record_at("1.2.3.4", now).await;
        assert_eq!(limiter.sweep_at(now + Duration::minutes(1)).await, 0);
        assert_eq!(limiter.sweep_at(now + Duration::minutes(16)).await, 1);
    }
}
