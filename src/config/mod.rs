//! Configuration management for the wallet auth server
//!
//! Settings are read from environment variables (and a `.env` file when
//! present). Every value has a development default so the server can start
//! with an empty environment; production refuses the default JWT secret.

use std::env;
use std::str::FromStr;

use chrono::Duration;
use thiserror::Error;

const DEFAULT_JWT_SECRET: &str = "development-secret-change-in-production";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid environment value: {0}")]
    InvalidValue(String),

    #[error("Invalid port number: {0}")]
    InvalidPort(String),
}

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "prod" | "production" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue(format!(
                "Invalid environment: '{}'. Expected: dev, staging, or prod",
                s
            ))),
        }
    }
}

/// Shape of the session returned by a successful verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Access/refresh tokens signed by this server, usable as-is
    #[default]
    Direct,
    /// Virtual-email credentials the client exchanges at the identity store
    Transitional,
}

impl FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "jwt" => Ok(SessionMode::Direct),
            "transitional" | "identity-store" => Ok(SessionMode::Transitional),
            _ => Err(ConfigError::InvalidValue(format!(
                "Invalid session mode: '{}'. Expected: direct or transitional",
                s
            ))),
        }
    }
}

/// Rate limiting policy for the nonce and verify endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window_seconds: i64,
    pub block_seconds: i64,
    pub sweep_interval_seconds: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_seconds)
    }

    pub fn block(&self) -> Duration {
        Duration::seconds(self.block_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_seconds: 15 * 60,
            block_seconds: 60 * 60,
            sweep_interval_seconds: 5 * 60,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Current environment
    pub environment: Environment,

    /// Bind address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Log level (RUST_LOG)
    pub log_level: String,

    /// CORS allowed origins, comma separated
    pub cors_allowed_origins: Option<String>,

    /// Take the client IP from `X-Forwarded-For`/`X-Real-IP`; only set
    /// behind a proxy that overwrites those headers
    pub trust_proxy_headers: bool,

    /// Domain that challenge messages must name
    pub auth_domain: String,

    /// URI line of challenge messages
    pub auth_uri: String,

    /// Statement line of challenge messages
    pub auth_statement: String,

    /// Auth nonce TTL in seconds (default: 300 = 5 minutes)
    pub auth_nonce_ttl_seconds: i64,

    /// Oldest accepted `Issued At` of a signed challenge, in seconds
    pub signature_max_age_seconds: i64,

    pub rate_limit: RateLimitConfig,

    /// Security event ring buffer size
    pub security_event_capacity: usize,

    pub session_mode: SessionMode,

    /// JWT secret for token signing
    pub jwt_secret: String,

    /// Access token TTL in seconds (default: 900 = 15 minutes)
    pub jwt_access_token_ttl_seconds: i64,

    /// Refresh token TTL in days (default: 7)
    pub jwt_refresh_token_ttl_days: i64,

    /// Admin endpoint of the identity store (transitional mode)
    pub identity_store_url: Option<String>,

    /// Service key for the identity store admin API
    pub identity_store_service_key: Option<String>,

    /// Domain of the virtual email provisioned per wallet
    pub virtual_email_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            host: "127.0.0.1".to_string(),
            port: 3001,
            log_level: "info".to_string(),
            cors_allowed_origins: None,
            trust_proxy_headers: false,
            auth_domain: "localhost:3000".to_string(),
            auth_uri: "http://localhost:3000".to_string(),
            auth_statement: "Sign in with your wallet.".to_string(),
            auth_nonce_ttl_seconds: 300,
            signature_max_age_seconds: 300,
            rate_limit: RateLimitConfig::default(),
            security_event_capacity: 1000,
            session_mode: SessionMode::Direct,
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            jwt_access_token_ttl_seconds: 900,
            jwt_refresh_token_ttl_days: 7,
            identity_store_url: None,
            identity_store_service_key: None,
            virtual_email_domain: "web3.wallet".to_string(),
        }
    }
}

/// Read `key`, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors)
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let environment = env::var("ENVIRONMENT")
            .map(|s| s.parse::<Environment>())
            .unwrap_or(Ok(Environment::Development))?;

        let session_mode = env::var("SESSION_MODE")
            .map(|s| s.parse::<SessionMode>())
            .unwrap_or(Ok(SessionMode::Direct))?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| defaults.port.to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort("PORT must be a valid number".to_string()))?;

        let rate_limit = RateLimitConfig {
            max_attempts: env_or("RATE_LIMIT_MAX_ATTEMPTS", defaults.rate_limit.max_attempts),
            window_seconds: env_or(
                "RATE_LIMIT_WINDOW_SECONDS",
                defaults.rate_limit.window_seconds,
            ),
            block_seconds: env_or(
                "RATE_LIMIT_BLOCK_SECONDS",
                defaults.rate_limit.block_seconds,
            ),
            sweep_interval_seconds: env_or(
                "RATE_LIMIT_SWEEP_SECONDS",
                defaults.rate_limit.sweep_interval_seconds,
            ),
        };

        let config = Config {
            environment,
            host: env::var("HOST").unwrap_or(defaults.host),
            port,
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS").ok(),
            trust_proxy_headers: env_or("TRUST_PROXY_HEADERS", defaults.trust_proxy_headers),
            auth_domain: env::var("AUTH_DOMAIN").unwrap_or(defaults.auth_domain),
            auth_uri: env::var("AUTH_URI").unwrap_or(defaults.auth_uri),
            auth_statement: env::var("AUTH_STATEMENT").unwrap_or(defaults.auth_statement),
            auth_nonce_ttl_seconds: env_or("AUTH_NONCE_TTL_SECONDS", defaults.auth_nonce_ttl_seconds),
            signature_max_age_seconds: env_or(
                "AUTH_SIGNATURE_MAX_AGE_SECONDS",
                defaults.signature_max_age_seconds,
            ),
            rate_limit,
            security_event_capacity: env_or(
                "SECURITY_EVENT_CAPACITY",
                defaults.security_event_capacity,
            ),
            session_mode,
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_access_token_ttl_seconds: env_or(
                "JWT_ACCESS_TOKEN_TTL_SECONDS",
                defaults.jwt_access_token_ttl_seconds,
            ),
            jwt_refresh_token_ttl_days: env_or(
                "JWT_REFRESH_TOKEN_TTL_DAYS",
                defaults.jwt_refresh_token_ttl_days,
            ),
            identity_store_url: env::var("IDENTITY_STORE_URL").ok(),
            identity_store_service_key: env::var("IDENTITY_STORE_SERVICE_KEY").ok(),
            virtual_email_domain: env::var("VIRTUAL_EMAIL_DOMAIN")
                .unwrap_or(defaults.virtual_email_domain),
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that a single variable cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_production() && self.jwt_secret == DEFAULT_JWT_SECRET {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }

        if self.session_mode == SessionMode::Transitional {
            if self.identity_store_url.is_none() {
                return Err(ConfigError::MissingEnvVar("IDENTITY_STORE_URL".to_string()));
            }
            if self.identity_store_service_key.is_none() {
                return Err(ConfigError::MissingEnvVar(
                    "IDENTITY_STORE_SERVICE_KEY".to_string(),
                ));
            }
        }

        if self.rate_limit.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RATE_LIMIT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.security_event_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SECURITY_EVENT_CAPACITY must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::seconds(self.auth_nonce_ttl_seconds)
    }

    pub fn signature_max_age(&self) -> Duration {
        Duration::seconds(self.signature_max_age_seconds)
    }
}
