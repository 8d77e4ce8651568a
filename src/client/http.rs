//! HTTP plumbing for the wallet client
//!
//! Every request to a protected path resolves its credential first. Network
//! errors and 5xx responses are retried with exponential backoff; a 401 is
//! never retried. When retries run out the caller sees `SERVER_UNAVAILABLE`
//! (or `REQUEST_TIMEOUT`), which is never confused with the reconnect case.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::error::{AuthError, ErrorCode, ErrorEnvelope, RetryPolicy};

use super::config::ClientConfig;
use super::resolver::{AuthHeaderResolver, CredentialSource};
use super::session_store::SessionStore;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    /// Attempts, first try included
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetrySettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempts run out. The last error is returned unchanged.
pub(crate) async fn with_retry<T, F, Fut>(
    settings: RetrySettings,
    what: &str,
    mut op: F,
) -> Result<T, AuthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AuthError>>,
{
    let mut delay = settings.base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.code.retry_policy() == RetryPolicy::Backoff && attempt < settings.attempts => {
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = settings.attempts,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Classify an error that survived [`with_retry`]
pub(crate) fn after_retries(err: AuthError) -> AuthError {
    match err.code {
        ErrorCode::RequestTimeout => err,
        code if code.retry_policy() == RetryPolicy::Backoff => {
            AuthError::with_detail(ErrorCode::ServerUnavailable, err.to_string())
        }
        _ => err,
    }
}

/// Classify a non-success response
pub(crate) async fn error_from_response(response: reqwest::Response) -> AuthError {
    let status = response.status();
    match response.text().await {
        Ok(body) => error_from_body(status, &body),
        Err(e) => AuthError::from(e),
    }
}

/// A taxonomy envelope keeps its code; anything else is classified by status
pub(crate) fn error_from_body(status: StatusCode, body: &str) -> AuthError {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.into();
    }

    let code = match status.as_u16() {
        401 | 403 => ErrorCode::AuthenticationRequired,
        408 | 504 => ErrorCode::RequestTimeout,
        429 => ErrorCode::RateLimitExceeded,
        s if s >= 500 => ErrorCode::InternalServerError,
        _ => ErrorCode::InvalidRequest,
    };
    AuthError::with_detail(code, format!("HTTP {}", status))
}

/// Client for protected API calls
pub struct ApiClient {
    http: Client,
    base_url: Url,
    resolver: Arc<AuthHeaderResolver>,
    store: Arc<SessionStore>,
    retry: RetrySettings,
}

impl ApiClient {
    pub fn new(
        config: &ClientConfig,
        resolver: Arc<AuthHeaderResolver>,
        store: Arc<SessionStore>,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            AuthError::with_detail(ErrorCode::InvalidRequest, format!("invalid base URL: {}", e))
        })?;
        Ok(Self {
            http,
            base_url,
            resolver,
            store,
            retry: RetrySettings::from_config(config),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path).map_err(|e| {
            AuthError::with_detail(ErrorCode::InvalidRequest, format!("invalid path {}: {}", path, e))
        })?;

        let url = &url;
        with_retry(self.retry, path, move || self.attempt(method.clone(), url, path, body))
            .await
            .map_err(after_retries)
    }

    async fn attempt<B, T>(
        &self,
        method: Method,
        url: &Url,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let auth = self.resolver.resolve(path).await?;

        let mut request = self.http.request(method, url.clone());
        if let Some(header) = &auth.header {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        if status == StatusCode::UNAUTHORIZED {
            let err = error_from_response(response).await;
            return Err(self.unauthorized(path, auth.source, err).await);
        }

        Err(error_from_response(response).await)
    }

    /// A rejected wallet credential ends the session; the user has to reconnect
    async fn unauthorized(&self, path: &str, source: CredentialSource, err: AuthError) -> AuthError {
        if source != CredentialSource::Wallet {
            return AuthError {
                code: ErrorCode::AuthenticationRequired,
                ..err
            };
        }

        tracing::warn!(path, error = %err, "Wallet credential rejected, clearing session");
        if let Err(e) = self.store.clear().await {
            tracing::error!(error = %e, "Failed to clear rejected session");
        }
        AuthError::with_detail(ErrorCode::SessionExpired, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetrySettings {
        RetrySettings {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(fast(), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AuthError::new(ErrorCode::NetworkError))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_session_expired_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(fast(), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AuthError::new(ErrorCode::SessionExpired))
        })
        .await;

        assert_eq!(after_retries(result.unwrap_err()).code, ErrorCode::SessionExpired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_server_unavailable() {
        let result: Result<(), _> = with_retry(fast(), "test", || async {
            Err(AuthError::new(ErrorCode::InternalServerError))
        })
        .await;
        assert_eq!(after_retries(result.unwrap_err()).code, ErrorCode::ServerUnavailable);

        let result: Result<(), _> = with_retry(fast(), "test", || async {
            Err(AuthError::new(ErrorCode::RequestTimeout))
        })
        .await;
        assert_eq!(after_retries(result.unwrap_err()).code, ErrorCode::RequestTimeout);
    }

    #[test]
    fn test_error_from_body() {
        let envelope = r#"{"success":false,"error":{"code":"NONCE_INVALID","message":"x","retryable":false}}"#;
        assert_eq!(
            error_from_body(StatusCode::UNAUTHORIZED, envelope).code,
            ErrorCode::NonceInvalid
        );
        assert_eq!(
            error_from_body(StatusCode::BAD_GATEWAY, "<html>").code,
            ErrorCode::InternalServerError
        );
        assert_eq!(
            error_from_body(StatusCode::UNAUTHORIZED, "").code,
            ErrorCode::AuthenticationRequired
        );
        assert_eq!(
            error_from_body(StatusCode::TOO_MANY_REQUESTS, "").code,
            ErrorCode::RateLimitExceeded
        );
    }
}
