//! Single-use login nonces
//!
//! A nonce is scoped to one wallet address and accepted for exactly one
//! verify attempt. Issuing a new nonce for an address replaces the
//! outstanding one, so only the latest challenge can be used.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A server-issued nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    pub value: String,
    pub address: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl NonceRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NonceError {
    #[error("Nonce not found")]
    NotFound,

    #[error("Nonce already used")]
    AlreadyConsumed,

    #[error("Nonce expired")]
    Expired,

    #[error("Nonce storage error: {0}")]
    Storage(String),
}

/// Persistence for outstanding nonces
///
/// Implementations must make [`NonceStore::consume`] atomic: two concurrent
/// calls for the same nonce may not both succeed.
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Store a nonce, replacing any outstanding nonce for the same address.
    /// Returns the replaced record, if any.
    async fn insert(&self, record: NonceRecord) -> Result<Option<NonceRecord>, NonceError>;

    /// Mark the nonce for `address` as consumed if it matches `value`, is
    /// unused and unexpired.
    async fn consume(
        &self,
        address: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceRecord, NonceError>;

    /// Drop expired records. Returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, NonceError>;
}

/// In-memory nonce store keyed by address
#[derive(Clone, Default)]
pub struct InMemoryNonceStore {
    nonces: Arc<RwLock<HashMap<String, NonceRecord>>>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nonces.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn insert(&self, record: NonceRecord) -> Result<Option<NonceRecord>, NonceError> {
        let mut nonces = self
            .nonces
            .write()
            .map_err(|e| NonceError::Storage(e.to_string()))?;
        Ok(nonces.insert(record.address.clone(), record))
    }

    async fn consume(
        &self,
        address: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceRecord, NonceError> {
        let mut nonces = self
            .nonces
            .write()
            .map_err(|e| NonceError::Storage(e.to_string()))?;

        let record = nonces.get_mut(address).ok_or(NonceError::NotFound)?;

        if record.value != value {
            return Err(NonceError::NotFound);
        }
        if record.consumed {
            return Err(NonceError::AlreadyConsumed);
        }
        if record.is_expired(now) {
            nonces.remove(address);
            return Err(NonceError::Expired);
        }

        record.consumed = true;
        Ok(record.clone())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, NonceError> {
        let mut nonces = self
            .nonces
            .write()
            .map_err(|e| NonceError::Storage(e.to_string()))?;
        let before = nonces.len();
        nonces.retain(|_, record| !record.is_expired(now));
        Ok(before - nonces.len())
    }
}

/// Issues and redeems nonces
#[derive(Clone)]
pub struct NonceService {
    store: Arc<dyn NonceStore>,
    ttl: Duration,
}

impl NonceService {
    pub fn new(store: Arc<dyn NonceStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh nonce for a normalized address
    pub async fn issue(&self, address: &str) -> Result<NonceRecord, NonceError> {
        self.issue_at(address, Utc::now()).await
    }

    pub async fn issue_at(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceRecord, NonceError> {
        let record = NonceRecord {
            value: generate_secure_nonce(),
            address: address.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };

        if let Some(previous) = self.store.insert(record.clone()).await? {
            if !previous.consumed && !previous.is_expired(now) {
                tracing::debug!(address = %address, "Replaced outstanding nonce");
            }
        }

        Ok(record)
    }

    /// Redeem a nonce; it can never be redeemed again
    pub async fn consume_at(
        &self,
        address: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<NonceRecord, NonceError> {
        self.store.consume(address, value, now).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, NonceError> {
        self.store.sweep(now).await
    }

    /// Spawn a task that sweeps expired nonces until `shutdown` fires
    pub fn start_sweep_task(
        self: &Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match service.sweep_at(Utc::now()).await {
                            Ok(0) => {}
                            Ok(removed) => tracing::debug!(removed, "Swept expired nonces"),
                            Err(e) => tracing::warn!(error = %e, "Nonce sweep failed"),
                        }
                    }
                }
            }
        });
    }
}

/// Generate a cryptographically secure nonce
pub fn generate_secure_nonce() -> String {
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}
