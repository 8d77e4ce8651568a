//! Public auth endpoints: nonce issuance and signature verification

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};

use crate::auth::nonce::generate_secure_nonce;
use crate::error::{AuthError, ErrorCode};
use crate::models::{NonceRequest, NonceResponse, VerifyEnvelope, VerifyRequest};

use super::config::ClientConfig;
use super::http::{after_retries, error_from_response, with_retry, RetrySettings};

/// A nonce ready to be embedded in a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceGrant {
    pub nonce: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub domain: Option<String>,
    pub uri: Option<String>,
    pub statement: Option<String>,
    /// Generated locally because the server could not be reached
    pub degraded: bool,
}

impl From<NonceResponse> for NonceGrant {
    fn from(response: NonceResponse) -> Self {
        Self {
            nonce: response.nonce,
            expires_at: response.expires_at,
            domain: response.domain,
            uri: response.uri,
            statement: response.statement,
            degraded: false,
        }
    }
}

pub struct AuthApi {
    http: Client,
    base_url: String,
    nonce_timeout: Duration,
    retry: RetrySettings,
    allow_local_nonce_fallback: bool,
}

impl AuthApi {
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            nonce_timeout: config.nonce_timeout,
            retry: RetrySettings::from_config(config),
            allow_local_nonce_fallback: config.allow_local_nonce_fallback,
        })
    }

    /// Fetch a nonce for `address`.
    ///
    /// Each attempt is bounded by the nonce timeout. If every attempt fails
    /// on the transport and the local fallback is enabled, a client-side
    /// nonce is returned instead; the server still has to accept it on
    /// verify, so this only helps against servers that skip issuance.
    pub async fn request_nonce(&self, address: &str) -> Result<NonceGrant, AuthError> {
        let body = NonceRequest {
            address: address.to_string(),
        };

        let result = with_retry(self.retry, "nonce", || {
            self.post_json::<_, NonceResponse>("/auth/nonce", &body, Some(self.nonce_timeout))
        })
        .await;

        match result {
            Ok(response) => Ok(response.into()),
            Err(e) if self.allow_local_nonce_fallback && is_transport(&e) => {
                tracing::warn!(
                    address,
                    error = %e,
                    "Nonce issuance unavailable, using locally generated nonce"
                );
                Ok(NonceGrant {
                    nonce: generate_secure_nonce(),
                    expires_at: None,
                    domain: None,
                    uri: None,
                    statement: None,
                    degraded: true,
                })
            }
            Err(e) => Err(after_retries(e)),
        }
    }

    /// Submit a signed challenge. Retried only on network errors and 5xx.
    pub async fn verify(&self, request: &VerifyRequest) -> Result<VerifyEnvelope, AuthError> {
        with_retry(self.retry, "verify", || {
            self.post_json::<_, VerifyEnvelope>("/auth/verify", request, None)
        })
        .await
        .map_err(after_retries)
    }

    async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json::<T>().await?)
    }
}

fn is_transport(err: &AuthError) -> bool {
    matches!(
        err.code,
        ErrorCode::NetworkError | ErrorCode::RequestTimeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> ClientConfig {
        ClientConfig {
            retry_base_delay: Duration::from_millis(1),
            nonce_timeout: Duration::from_millis(200),
            ..ClientConfig::default().with_base_url(base_url)
        }
    }

    #[tokio::test]
    async fn test_nonce_retried_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/nonce"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/nonce"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nonce": "abc123",
                "domain": "app.test"
            })))
            .mount(&server)
            .await;

        let api = AuthApi::new(&config(&server.uri())).unwrap();
        let grant = api.request_nonce("0xabc").await.unwrap();
        assert_eq!(grant.nonce, "abc123");
        assert_eq!(grant.domain.as_deref(), Some("app.test"));
        assert!(!grant.degraded);
    }

    #[tokio::test]
    async fn test_slow_nonce_without_fallback_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/nonce"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "nonce": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let api = AuthApi::new(&config(&server.uri())).unwrap();
        let err = api.request_nonce("0xabc").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestTimeout);
    }

    #[tokio::test]
    async fn test_local_fallback_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/nonce"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "nonce": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let api = AuthApi::new(&ClientConfig {
            allow_local_nonce_fallback: true,
            ..config(&server.uri())
        })
        .unwrap();
        let grant = api.request_nonce("0xabc").await.unwrap();
        assert!(grant.degraded);
        assert_eq!(grant.nonce.len(), 64);
    }

    #[tokio::test]
    async fn test_verify_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "success": false,
                "error": {
                    "code": "SIGNATURE_INVALID",
                    "message": "The signature could not be verified.",
                    "retryable": false
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = AuthApi::new(&config(&server.uri())).unwrap();
        let err = api
            .verify(&VerifyRequest {
                wallet_address: "0xabc".to_string(),
                signature: "0x00".to_string(),
                message: "m".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SignatureInvalid);
    }
}
