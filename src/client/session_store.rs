//! Persisted wallet session
//!
//! A wallet session lives under three keys that are written and cleared as
//! a unit:
//! - `current_user`: the authenticated identity
//! - `walletconnect_auth`: bearer/refresh tokens and their expiry
//! - `wallet_session`: which wallet and chain produced them
//!
//! A fourth key holds a conventional (non-wallet) session, removed together
//! with the wallet keys on sign-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::{AuthError, ErrorCode};
use crate::models::{TokenResponse, UserResponse, WalletIdentity};

use super::bridge::{SessionSource, VerifiedSession};
use super::identity::IdentityStore;
use super::storage::{KeyValueStorage, StorageError};

/// Session store failures
#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Corrupt session record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Session record is incomplete")]
    Incomplete,

    #[error("Session record did not read back as written")]
    VerifyFailed,
}

impl From<SessionStoreError> for AuthError {
    fn from(err: SessionStoreError) -> Self {
        AuthError::with_detail(ErrorCode::DatabaseError, err.to_string())
    }
}

/// Tokens of a wallet session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAuthRecord {
    pub auth_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub wallet_address: String,
    pub source: SessionSource,
    /// Unix seconds
    pub expires_at: i64,
    /// When these tokens were obtained; a record never replaces a fresher one
    pub issued_at: DateTime<Utc>,
}

/// Which wallet a session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSessionMarker {
    pub wallet_address: String,
    pub chain_id: u64,
    pub provider_name: String,
    pub connected_at: DateTime<Utc>,
}

/// The three persisted records of a wallet session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user: UserResponse,
    pub auth: WalletAuthRecord,
    pub wallet: WalletSessionMarker,
}

impl SessionRecord {
    pub fn new(session: VerifiedSession, identity: &WalletIdentity, now: DateTime<Utc>) -> Self {
        Self {
            auth: WalletAuthRecord {
                auth_token: session.access_token,
                refresh_token: session.refresh_token,
                token_type: session.token_type,
                wallet_address: session.user.wallet_address.clone(),
                source: session.source,
                expires_at: session.expires_at.timestamp(),
                issued_at: now,
            },
            user: session.user,
            wallet: WalletSessionMarker {
                wallet_address: identity.address.clone(),
                chain_id: identity.chain_id,
                provider_name: identity.provider_name.clone(),
                connected_at: now,
            },
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.auth.expires_at
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.auth.auth_token)
    }

    /// The same session with refreshed tokens, if their expiry is known
    fn refreshed(&self, tokens: TokenResponse, now: DateTime<Utc>) -> Option<Self> {
        let expires_at = tokens.resolve_expiry(now)?;
        let mut record = self.clone();
        record.auth.auth_token = tokens.access_token;
        if !tokens.refresh_token.is_empty() {
            record.auth.refresh_token = Some(tokens.refresh_token);
        }
        record.auth.expires_at = expires_at.timestamp();
        record.auth.issued_at = now;
        Some(record)
    }
}

/// A session obtained without a wallet (email login and the like)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionalSession {
    pub access_token: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

struct SessionKeys {
    current_user: String,
    wallet_auth: String,
    wallet_session: String,
    conventional: String,
}

impl SessionKeys {
    fn new(namespace: &str) -> Self {
        let ns = namespace.trim_end_matches('/');
        Self {
            current_user: format!("{}/current_user", ns),
            wallet_auth: format!("{}/walletconnect_auth", ns),
            wallet_session: format!("{}/wallet_session", ns),
            conventional: format!("{}/conventional_session", ns),
        }
    }

    fn wallet(&self) -> [&str; 3] {
        [
            self.current_user.as_str(),
            self.wallet_auth.as_str(),
            self.wallet_session.as_str(),
        ]
    }
}

/// Persists, restores and clears the wallet session.
///
/// All operations are serialized, so the three wallet keys are never
/// observed half-written.
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    identity: Arc<dyn IdentityStore>,
    keys: SessionKeys,
    lock: Mutex<()>,
    reconnect_required: AtomicBool,
}

impl SessionStore {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        identity: Arc<dyn IdentityStore>,
        namespace: &str,
    ) -> Self {
        Self {
            storage,
            identity,
            keys: SessionKeys::new(namespace),
            lock: Mutex::new(()),
            reconnect_required: AtomicBool::new(false),
        }
    }

    /// Set once a restoration fails; cleared by a new session or `clear`
    pub fn reconnect_required(&self) -> bool {
        self.reconnect_required.load(Ordering::SeqCst)
    }

    /// Names of the three wallet keys
    pub fn wallet_keys(&self) -> [&str; 3] {
        self.keys.wallet()
    }

    /// Write a session record.
    ///
    /// Returns `false` without writing when the stored record is fresher.
    /// A record that does not read back intact is removed and reported.
    pub async fn persist(&self, record: &SessionRecord) -> Result<bool, AuthError> {
        let _guard = self.lock.lock().await;

        if let Ok(Some(existing)) = self.read_record().await {
            if existing.auth.issued_at > record.auth.issued_at {
                tracing::debug!(
                    address = %record.auth.wallet_address,
                    "Skipping stale session write"
                );
                return Ok(false);
            }
        }

        self.write_record(record).await?;
        self.reconnect_required.store(false, Ordering::SeqCst);
        Ok(true)
    }

    /// Current record without refreshing it
    pub async fn load(&self) -> Result<Option<SessionRecord>, AuthError> {
        let _guard = self.lock.lock().await;
        match self.read_record().await {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session record");
                self.remove_wallet_keys().await;
                Err(AuthError::with_detail(ErrorCode::SessionExpired, e.to_string()))
            }
        }
    }

    /// Load the session, refreshing it once if it has expired.
    ///
    /// A failed refresh clears the three wallet keys and reports
    /// `SESSION_EXPIRED`.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<Option<SessionRecord>, AuthError> {
        let _guard = self.lock.lock().await;

        let record = match self.read_record().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session record");
                self.abandon().await;
                return Err(AuthError::with_detail(ErrorCode::SessionExpired, e.to_string()));
            }
        };

        if !record.is_expired(now) {
            return Ok(Some(record));
        }

        let address = record.auth.wallet_address.clone();
        let Some(refresh_token) = record.auth.refresh_token.clone() else {
            tracing::info!(address = %address, "Session expired without refresh token");
            self.abandon().await;
            return Err(AuthError::with_detail(
                ErrorCode::SessionExpired,
                "no refresh token",
            ));
        };

        tracing::info!(address = %address, "Session expired, refreshing");
        let refreshed = match self.identity.refresh(&refresh_token).await {
            Ok(tokens) => record.refreshed(tokens, now),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Session refresh failed");
                self.abandon().await;
                return Err(AuthError::with_detail(
                    ErrorCode::SessionExpired,
                    format!("refresh failed: {}", e.code),
                ));
            }
        };

        let Some(refreshed) = refreshed else {
            self.abandon().await;
            return Err(AuthError::with_detail(
                ErrorCode::SessionExpired,
                "refreshed session has no expiry",
            ));
        };

        if let Err(e) = self.write_record(&refreshed).await {
            self.reconnect_required.store(true, Ordering::SeqCst);
            return Err(AuthError::with_detail(ErrorCode::SessionExpired, e.to_string()));
        }

        tracing::info!(address = %address, expires_at = refreshed.auth.expires_at, "Session restored");
        Ok(Some(refreshed))
    }

    /// Remove the wallet session and any conventional session
    pub async fn clear(&self) -> Result<(), AuthError> {
        let _guard = self.lock.lock().await;
        self.reconnect_required.store(false, Ordering::SeqCst);
        let mut first_error = None;
        for key in self.keys.wallet().into_iter().chain([self.keys.conventional.as_str()]) {
            if let Err(e) = self.storage.remove(key).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(SessionStoreError::from(e).into()),
            None => Ok(()),
        }
    }

    pub async fn set_conventional(&self, session: &ConventionalSession) -> Result<(), AuthError> {
        let _guard = self.lock.lock().await;
        let value = serde_json::to_string(session)?;
        self.storage
            .set(&self.keys.conventional, &value)
            .await
            .map_err(SessionStoreError::from)?;
        Ok(())
    }

    pub async fn conventional(&self) -> Result<Option<ConventionalSession>, AuthError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_key(&self.keys.conventional).await?)
    }

    async fn read_key<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, SessionStoreError> {
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SessionStoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    async fn read_record(&self) -> Result<Option<SessionRecord>, SessionStoreError> {
        let user: Option<UserResponse> = self.read_key(&self.keys.current_user).await?;
        let auth: Option<WalletAuthRecord> = self.read_key(&self.keys.wallet_auth).await?;
        let wallet: Option<WalletSessionMarker> = self.read_key(&self.keys.wallet_session).await?;

        match (user, auth, wallet) {
            (Some(user), Some(auth), Some(wallet)) => Ok(Some(SessionRecord { user, auth, wallet })),
            (None, None, None) => Ok(None),
            _ => Err(SessionStoreError::Incomplete),
        }
    }

    /// Write the three keys, then read them back; roll back on any failure
    async fn write_record(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let result = self.try_write_record(record).await;
        if result.is_err() {
            self.remove_wallet_keys().await;
        }
        result
    }

    async fn try_write_record(&self, record: &SessionRecord) -> Result<(), SessionStoreError> {
        let user = serde_json::to_string(&record.user).map_err(|e| corrupt(&self.keys.current_user, e))?;
        let auth = serde_json::to_string(&record.auth).map_err(|e| corrupt(&self.keys.wallet_auth, e))?;
        let wallet =
            serde_json::to_string(&record.wallet).map_err(|e| corrupt(&self.keys.wallet_session, e))?;

        self.storage.set(&self.keys.wallet_session, &wallet).await?;
        self.storage.set(&self.keys.wallet_auth, &auth).await?;
        self.storage.set(&self.keys.current_user, &user).await?;

        match self.read_record().await? {
            Some(stored) if stored == *record => Ok(()),
            _ => Err(SessionStoreError::VerifyFailed),
        }
    }

    async fn abandon(&self) {
        self.reconnect_required.store(true, Ordering::SeqCst);
        self.remove_wallet_keys().await;
    }

    async fn remove_wallet_keys(&self) {
        for key in self.keys.wallet() {
            if let Err(e) = self.storage.remove(key).await {
                tracing::error!(key, error = %e, "Failed to remove session key");
            }
        }
    }
}

fn corrupt(key: &str, err: serde_json::Error) -> SessionStoreError {
    SessionStoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::storage::MemoryStorage;
    use crate::models::WalletUser;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    struct CountingIdentity {
        refreshes: AtomicU32,
        succeed: bool,
    }

    #[async_trait]
    impl IdentityStore for CountingIdentity {
        async fn password_login(&self, _: &str, _: &str) -> Result<TokenResponse, AuthError> {
            Err(AuthError::new(ErrorCode::AuthenticationRequired))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if !self.succeed {
                return Err(AuthError::new(ErrorCode::SessionExpired));
            }
            Ok(TokenResponse {
                access_token: format!("{}-access", refresh_token),
                refresh_token: "rt-2".to_string(),
                token_type: "Bearer".to_string(),
                expires_in: Some(900),
                expires_at: None,
                user: None,
            })
        }
    }

    fn setup(succeed: bool) -> (Arc<MemoryStorage>, Arc<CountingIdentity>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        let identity = Arc::new(CountingIdentity {
            refreshes: AtomicU32::new(0),
            succeed,
        });
        let store = SessionStore::new(storage.clone(), identity.clone(), "wallet-auth/v1");
        (storage, identity, store)
    }

    fn record(issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> SessionRecord {
        let user = UserResponse::from(WalletUser::for_wallet(ADDRESS, issued_at));
        let session = VerifiedSession {
            user,
            access_token: "at-1".to_string(),
            refresh_token: Some("rt-1".to_string()),
            token_type: "Bearer".to_string(),
            expires_at,
            source: SessionSource::Direct,
        };
        let identity = WalletIdentity {
            address: ADDRESS.to_string(),
            chain_id: 1,
            provider_name: "test".to_string(),
        };
        SessionRecord::new(session, &identity, issued_at)
    }

    async fn all_keys_absent(storage: &MemoryStorage, store: &SessionStore) -> bool {
        for key in store.wallet_keys() {
            if storage.get(key).await.unwrap().is_some() {
                return false;
            }
        }
        true
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let (storage, _, store) = setup(true);
        let now = Utc::now();
        let rec = record(now, now + Duration::minutes(15));

        assert!(store.persist(&rec).await.unwrap());
        assert_eq!(store.load().await.unwrap(), Some(rec));
        assert!(storage
            .get("wallet-auth/v1/walletconnect_auth")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_stale_record_not_written_over_fresher() {
        let (_, _, store) = setup(true);
        let now = Utc::now();
        let fresh = record(now, now + Duration::minutes(15));
        let stale = record(now - Duration::minutes(1), now + Duration::minutes(14));

        assert!(store.persist(&fresh).await.unwrap());
        assert!(!store.persist(&stale).await.unwrap());
        assert_eq!(store.load().await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_restore_unexpired_does_not_refresh() {
        let (_, identity, store) = setup(true);
        let now = Utc::now();
        store
            .persist(&record(now, now + Duration::minutes(15)))
            .await
            .unwrap();

        assert!(store.restore(now).await.unwrap().is_some());
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restore_refreshes_expired_session_once() {
        let (_, identity, store) = setup(true);
        let now = Utc::now();
        store
            .persist(&record(now - Duration::hours(1), now - Duration::seconds(1)))
            .await
            .unwrap();

        let restored = store.restore(now).await.unwrap().unwrap();
        assert_eq!(restored.auth.auth_token, "rt-1-access");
        assert_eq!(restored.auth.refresh_token.as_deref(), Some("rt-2"));
        assert!(!restored.is_expired(now));
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 1);

        // Second restore sees the refreshed record
        store.restore(now).await.unwrap();
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_restore_clears_all_keys() {
        let (storage, identity, store) = setup(false);
        let now = Utc::now();
        store
            .persist(&record(now - Duration::hours(1), now - Duration::seconds(1)))
            .await
            .unwrap();

        let err = store.restore(now).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionExpired);
        assert_eq!(identity.refreshes.load(Ordering::SeqCst), 1);
        assert!(all_keys_absent(&storage, &store).await);
        assert!(store.reconnect_required());

        store.clear().await.unwrap();
        assert!(!store.reconnect_required());
    }

    #[tokio::test]
    async fn test_incomplete_record_is_discarded() {
        let (storage, _, store) = setup(true);
        let now = Utc::now();
        store
            .persist(&record(now, now + Duration::minutes(15)))
            .await
            .unwrap();
        storage.remove("wallet-auth/v1/wallet_session").await.unwrap();

        let err = store.load().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionExpired);
        assert!(all_keys_absent(&storage, &store).await);
    }

    #[tokio::test]
    async fn test_clear_removes_conventional_session_too() {
        let (storage, _, store) = setup(true);
        let now = Utc::now();
        store
            .persist(&record(now, now + Duration::minutes(15)))
            .await
            .unwrap();
        store
            .set_conventional(&ConventionalSession {
                access_token: "email-session".to_string(),
                expires_at: None,
            })
            .await
            .unwrap();

        store.clear().await.unwrap();

        assert!(all_keys_absent(&storage, &store).await);
        assert_eq!(store.conventional().await.unwrap(), None);
    }
}
