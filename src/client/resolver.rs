//! Authorization header resolution
//!
//! Picks the credential for an outgoing request:
//! 1. public paths carry none
//! 2. an unexpired wallet session supplies its bearer token
//! 3. an expired wallet session is restored once, shared by every caller
//!    waiting on it; if that fails the caller must reconnect, with no
//!    fallback to a conventional session
//! 4. without a wallet session, a conventional session is used if present

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::{AuthError, ErrorCode};

use super::session_store::{SessionRecord, SessionStore};

/// Source of a non-wallet bearer token
#[async_trait]
pub trait ConventionalSessionSource: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>, AuthError>;
}

#[async_trait]
impl ConventionalSessionSource for SessionStore {
    async fn access_token(&self) -> Result<Option<String>, AuthError> {
        let now = Utc::now().timestamp();
        Ok(self
            .conventional()
            .await?
            .filter(|s| s.expires_at.map_or(true, |at| at > now))
            .map(|s| s.access_token))
    }
}

/// Where a resolved credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Public,
    Wallet,
    Conventional,
}

/// Outcome of resolving a request's credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    /// Full `Authorization` header value
    pub header: Option<String>,
    pub source: CredentialSource,
}

type RestoreFuture = Shared<BoxFuture<'static, Result<Option<SessionRecord>, AuthError>>>;

pub struct AuthHeaderResolver {
    store: Arc<SessionStore>,
    conventional: Arc<dyn ConventionalSessionSource>,
    public_prefixes: Vec<String>,
    inflight: Mutex<Option<RestoreFuture>>,
}

impl AuthHeaderResolver {
    pub fn new(
        store: Arc<SessionStore>,
        conventional: Arc<dyn ConventionalSessionSource>,
        public_prefixes: Vec<String>,
    ) -> Self {
        Self {
            store,
            conventional,
            public_prefixes,
            inflight: Mutex::new(None),
        }
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Resolve the credential for a request to `path`
    pub async fn resolve(&self, path: &str) -> Result<ResolvedAuth, AuthError> {
        if self.is_public(path) {
            return Ok(ResolvedAuth {
                header: None,
                source: CredentialSource::Public,
            });
        }

        match self.store.load().await? {
            Some(record) if !record.is_expired(Utc::now()) => Ok(wallet_auth(&record)),
            Some(_) => {
                let record = self.restore_once().await?;
                Ok(wallet_auth(&record))
            }
            None if self.store.reconnect_required() => Err(AuthError::with_detail(
                ErrorCode::SessionExpired,
                "wallet session could not be restored",
            )),
            None => match self.conventional.access_token().await? {
                Some(token) => Ok(ResolvedAuth {
                    header: Some(format!("Bearer {}", token)),
                    source: CredentialSource::Conventional,
                }),
                None => Err(AuthError::with_detail(
                    ErrorCode::AuthenticationRequired,
                    "no session",
                )),
            },
        }
    }

    /// Restore the wallet session, joining a restoration already in flight
    async fn restore_once(&self) -> Result<SessionRecord, AuthError> {
        let restore = {
            let mut slot = self
                .inflight
                .lock()
                .map_err(|_| AuthError::new(ErrorCode::InternalServerError))?;
            match slot.as_ref() {
                Some(restore) => restore.clone(),
                None => {
                    let store = self.store.clone();
                    let restore = async move { store.restore(Utc::now()).await }
                        .boxed()
                        .shared();
                    *slot = Some(restore.clone());
                    restore
                }
            }
        };

        let result = restore.clone().await;

        if let Ok(mut slot) = self.inflight.lock() {
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&restore)) {
                *slot = None;
            }
        }

        match result {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(AuthError::with_detail(
                ErrorCode::SessionExpired,
                "wallet session no longer present",
            )),
            Err(e) if e.code == ErrorCode::SessionExpired => Err(e),
            Err(e) => Err(AuthError::with_detail(ErrorCode::SessionExpired, e.to_string())),
        }
    }
}

fn wallet_auth(record: &SessionRecord) -> ResolvedAuth {
    ResolvedAuth {
        header: Some(record.bearer()),
        source: CredentialSource::Wallet,
    }
}
