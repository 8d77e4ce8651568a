//! Identity store token grants

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::AuthError;
use crate::models::{PasswordGrantRequest, RefreshTokenRequest, TokenResponse};

use super::config::ClientConfig;
use super::http::error_from_response;

/// Token grants of the identity store
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Exchange email and password for a session
    async fn password_login(&self, email: &str, password: &str)
        -> Result<TokenResponse, AuthError>;

    /// Exchange a refresh token for a new session
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;
}

/// Identity store reached over HTTP
///
/// - `POST {token_endpoint}?grant_type=password {email, password}`
/// - `POST {token_endpoint}?grant_type=refresh_token {refresh_token}`
pub struct HttpIdentityStore {
    client: Client,
    token_endpoint: String,
    api_key: Option<String>,
}

impl HttpIdentityStore {
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            token_endpoint: config.token_endpoint(),
            api_key: config.identity_store_api_key.clone(),
        })
    }

    async fn grant<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<TokenResponse, AuthError> {
        let mut request = self
            .client
            .post(&self.token_endpoint)
            .query(&[("grant_type", grant_type)])
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<TokenResponse>().await?)
    }
}

#[async_trait]
impl IdentityStore for HttpIdentityStore {
    async fn password_login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, AuthError> {
        let body = PasswordGrantRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.grant("password", &body).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let body = RefreshTokenRequest {
            refresh_token: refresh_token.to_string(),
        };
        self.grant("refresh_token", &body).await
    }
}
