//! Wallet client configuration

use std::time::Duration;

/// Configuration for the wallet-side client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the auth server (nonce, verify, token)
    pub base_url: String,
    /// Token endpoint of the identity store; the auth server's own
    /// `/auth/token` when unset
    pub identity_store_url: Option<String>,
    /// API key sent to the identity store
    pub identity_store_api_key: Option<String>,
    /// Challenge domain used when the server does not advertise one
    pub auth_domain: String,
    /// Challenge URI used when the server does not advertise one
    pub auth_uri: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Per-attempt bound on a nonce fetch
    pub nonce_timeout: Duration,
    /// Bound on wallet provider initialization
    pub wallet_init_timeout: Duration,
    /// Attempts for network errors and 5xx responses, first try included
    pub retry_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub retry_base_delay: Duration,
    /// Synthesize a client nonce when the server cannot issue one
    pub allow_local_nonce_fallback: bool,
    /// Path prefixes that never carry credentials
    pub public_prefixes: Vec<String>,
    /// Namespace of persisted session keys
    pub storage_namespace: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            identity_store_url: None,
            identity_store_api_key: None,
            auth_domain: "localhost:3000".to_string(),
            auth_uri: "http://localhost:3000".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            nonce_timeout: Duration::from_secs(5),
            wallet_init_timeout: Duration::from_secs(20),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            allow_local_nonce_fallback: false,
            public_prefixes: vec![
                "/auth/nonce".to_string(),
                "/auth/verify".to_string(),
                "/auth/token".to_string(),
                "/health".to_string(),
                "/public".to_string(),
            ],
            storage_namespace: "wallet-auth/v1".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Identity store token endpoint, defaulting to the auth server's
    pub fn token_endpoint(&self) -> String {
        match &self.identity_store_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}/auth/token", self.base_url.trim_end_matches('/')),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}
