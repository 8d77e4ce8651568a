//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AuthService, ChallengePolicy, HttpIdentityAdmin, InMemoryNonceStore, JwtSessionIssuer,
    NonceService, SessionIssuer, TokenService, TransitionalSessionIssuer,
};
use crate::config::{Config, ConfigError, SessionMode};
use crate::middleware::RateLimiter;
use crate::monitor::SecurityMonitor;

/// Timeout for identity store admin calls
const IDENTITY_ADMIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub auth_service: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub monitor: Arc<SecurityMonitor>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        auth_service: Arc<AuthService>,
        rate_limiter: Arc<RateLimiter>,
        monitor: Arc<SecurityMonitor>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            auth_service,
            rate_limiter,
            monitor,
            config,
        }
    }

    /// Wire in-memory stores and the configured session issuer
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let nonces = Arc::new(NonceService::new(
            Arc::new(InMemoryNonceStore::new()),
            config.nonce_ttl(),
        ));
        let tokens = Arc::new(TokenService::new(
            config.jwt_secret.clone(),
            Duration::seconds(config.jwt_access_token_ttl_seconds),
            Duration::days(config.jwt_refresh_token_ttl_days),
        ));

        let issuer: Arc<dyn SessionIssuer> = match config.session_mode {
            SessionMode::Direct => Arc::new(JwtSessionIssuer::new(tokens.clone())),
            SessionMode::Transitional => {
                let url = config
                    .identity_store_url
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingEnvVar("IDENTITY_STORE_URL".to_string()))?;
                let key = config.identity_store_service_key.as_deref().ok_or_else(|| {
                    ConfigError::MissingEnvVar("IDENTITY_STORE_SERVICE_KEY".to_string())
                })?;
                let admin = HttpIdentityAdmin::new(url, key, IDENTITY_ADMIN_TIMEOUT)
                    .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
                Arc::new(TransitionalSessionIssuer::new(
                    Arc::new(admin),
                    config.virtual_email_domain.clone(),
                ))
            }
        };

        let policy = ChallengePolicy {
            domain: config.auth_domain.clone(),
            uri: config.auth_uri.clone(),
            statement: config.auth_statement.clone(),
            max_age: config.signature_max_age(),
        };

        let auth_service = Arc::new(AuthService::new(nonces, issuer, tokens, policy));
        let rate_limiter = Arc::new(RateLimiter::in_memory(config.rate_limit));
        let monitor = Arc::new(SecurityMonitor::in_memory(config.security_event_capacity));

        Ok(Self::new(
            auth_service,
            rate_limiter,
            monitor,
            Arc::new(config.clone()),
        ))
    }

    /// Start the periodic sweeps; they stop when `shutdown` fires
    pub fn start_background_tasks(&self, shutdown: CancellationToken) {
        let sweep_interval = self.config.rate_limit.sweep_interval();

        self.rate_limiter.start_sweep_task(shutdown.clone());
        self.auth_service
            .nonces()
            .start_sweep_task(sweep_interval, shutdown.clone());

        let tokens = self.auth_service.tokens().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tokens.sweep_at(Utc::now());
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired refresh tokens");
                        }
                    }
                }
            }
        });
    }
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.auth_service.clone()
    }
}

impl FromRef<AppState> for Arc<RateLimiter> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.rate_limiter.clone()
    }
}

impl FromRef<AppState> for Arc<SecurityMonitor> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.monitor.clone()
    }
}
