//! Wallet client tests against a live server and against mocked endpoints

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wallet_auth_bridge::client::{
    ClientConfig, ConventionalSession, IdentityChange, KeyValueStorage, LocalKeyProvider,
    MemoryStorage, ProviderKind, SessionRecord, SessionSource, VerifiedSession, WalletClient,
    WalletError, WalletProvider,
};
use wallet_auth_bridge::error::ErrorCode;
use wallet_auth_bridge::models::{UserResponse, WalletIdentity, WalletProfile, WalletUser};

use common::*;

const WALLET_KEYS: [&str; 3] = [
    "wallet-auth/v1/current_user",
    "wallet-auth/v1/walletconnect_auth",
    "wallet-auth/v1/wallet_session",
];

fn client_config(base_url: &str) -> ClientConfig {
    ClientConfig {
        retry_base_delay: StdDuration::from_millis(1),
        ..ClientConfig::default().with_base_url(base_url)
    }
}

fn local_wallet() -> Vec<Arc<dyn WalletProvider>> {
    vec![Arc::new(LocalKeyProvider::new(TEST_KEY, 1).unwrap())]
}

async fn keys_absent(storage: &MemoryStorage) -> bool {
    for key in WALLET_KEYS {
        if storage.get(key).await.unwrap().is_some() {
            return false;
        }
    }
    true
}

fn user_json() -> Value {
    serde_json::to_value(UserResponse::from(WalletUser::for_wallet(TEST_ADDRESS, Utc::now()))).unwrap()
}

fn expired_record() -> SessionRecord {
    let now = Utc::now();
    let session = VerifiedSession {
        user: UserResponse::from(WalletUser::for_wallet(TEST_ADDRESS, now)),
        access_token: "stale-access".to_string(),
        refresh_token: Some("rt-1".to_string()),
        token_type: "Bearer".to_string(),
        expires_at: now - Duration::seconds(30),
        source: SessionSource::Transitional,
    };
    let identity = WalletIdentity {
        address: TEST_ADDRESS.to_string(),
        chain_id: 1,
        provider_name: "local-key".to_string(),
    };
    SessionRecord::new(session, &identity, now - Duration::hours(1))
}

#[tokio::test]
async fn test_direct_sign_in_against_live_server() {
    let (_, router) = test_app();
    let addr = spawn_server(router).await;

    let storage = Arc::new(MemoryStorage::new());
    let client = WalletClient::new(
        client_config(&format!("http://{}", addr)),
        local_wallet(),
        storage.clone(),
    )
    .unwrap();

    let record = assert_ok!(client.flow.sign_in(&CancellationToken::new()).await);
    assert_eq!(record.auth.source, SessionSource::Direct);
    assert_eq!(record.wallet.wallet_address, TEST_ADDRESS);

    let profile: WalletProfile = assert_ok!(client.api.get("/auth/me").await);
    assert_eq!(profile.wallet_address, TEST_ADDRESS);

    assert_ok!(client.flow.sign_out().await);
    assert!(keys_absent(&storage).await);
    let err = client.api.get::<WalletProfile>("/auth/me").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthenticationRequired);
}

#[tokio::test]
async fn test_expired_session_restored_once_against_live_server() {
    let (_, router) = test_app();
    let addr = spawn_server(router).await;

    let storage = Arc::new(MemoryStorage::new());
    let client = Arc::new(
        WalletClient::new(
            client_config(&format!("http://{}", addr)),
            local_wallet(),
            storage.clone(),
        )
        .unwrap(),
    );
    let record = client.flow.sign_in(&CancellationToken::new()).await.unwrap();

    // Age the stored access token past its expiry
    let auth_key = "wallet-auth/v1/walletconnect_auth";
    let mut auth: Value = serde_json::from_str(&storage.get(auth_key).await.unwrap().unwrap()).unwrap();
    auth["expires_at"] = json!(Utc::now().timestamp() - 10);
    storage.set(auth_key, &auth.to_string()).await.unwrap();

    // Refresh tokens are single-use, so a second refresh would fail
    let calls: Vec<_> = (0..6)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.api.get::<WalletProfile>("/auth/me").await })
        })
        .collect();
    for call in calls {
        let profile = call.await.unwrap().unwrap();
        assert_eq!(profile.wallet_address, TEST_ADDRESS);
    }

    let restored = client.store.load().await.unwrap().unwrap();
    assert_ne!(restored.auth.auth_token, record.auth.auth_token);
    assert!(!restored.is_expired(Utc::now()));
}

#[tokio::test]
async fn test_transitional_sign_in_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/nonce"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nonce": "n-1",
            "domain": "app.test",
            "uri": "https://app.test"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "user": user_json(),
                "session": {
                    "email": "w3_0xabcd@domain",
                    "password": "p",
                    "web3_auth": true
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "password"))
        .and(body_json(json!({ "email": "w3_0xabcd@domain", "password": "p" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "Aries" })))
        .expect(2)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let config = ClientConfig {
        identity_store_url: Some(format!("{}/auth/v1/token", server.uri())),
        ..client_config(&server.uri())
    };
    let client = WalletClient::new(config, local_wallet(), storage.clone()).unwrap();

    let record = assert_ok!(client.flow.sign_in(&CancellationToken::new()).await);
    assert_eq!(record.auth.source, SessionSource::Transitional);
    assert_eq!(record.auth.auth_token, "at-1");
    assert_eq!(record.user.email.as_deref(), Some("w3_0xabcd@domain"));

    for _ in 0..2 {
        let body: Value = assert_ok!(client.api.get("/profile").await);
        assert_eq!(body["name"], "Aries");
    }
    for key in WALLET_KEYS {
        assert!(storage.get(key).await.unwrap().is_some(), "{} missing", key);
    }
}

#[tokio::test]
async fn test_failed_materialization_leaves_nothing_behind() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/nonce"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nonce": "n-1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "user": user_json(),
                "session": { "email": "w3_0xabcd@domain", "password": "p", "web3_auth": true }
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let config = ClientConfig {
        identity_store_url: Some(format!("{}/auth/v1/token", server.uri())),
        ..client_config(&server.uri())
    };
    let client = WalletClient::new(config, local_wallet(), storage.clone()).unwrap();

    let err = client
        .flow
        .sign_in(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionCreationFailed);
    assert!(keys_absent(&storage).await);
    assert!(client.flow.connector().identity().is_none());
}

#[tokio::test]
async fn test_failed_restore_requires_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .and(query_param("grant_type", "refresh_token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "error": {
                "code": "SESSION_EXPIRED",
                "message": "Your session has expired. Please reconnect your wallet.",
                "retryable": false
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let config = ClientConfig {
        identity_store_url: Some(format!("{}/auth/v1/token", server.uri())),
        ..client_config(&server.uri())
    };
    let client = Arc::new(WalletClient::new(config, local_wallet(), storage.clone()).unwrap());
    client.store.persist(&expired_record()).await.unwrap();
    client
        .store
        .set_conventional(&ConventionalSession {
            access_token: "email-session".to_string(),
            expires_at: None,
        })
        .await
        .unwrap();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.api.get::<Value>("/profile").await })
        })
        .collect();
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionExpired);
        assert_eq!(
            err.code.user_message(),
            "Your session has expired. Please reconnect your wallet."
        );
    }
    assert!(keys_absent(&storage).await);
}

#[tokio::test]
async fn test_rejected_wallet_credential_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let client = WalletClient::new(client_config(&server.uri()), local_wallet(), storage.clone()).unwrap();
    let mut record = expired_record();
    record.auth.expires_at = (Utc::now() + Duration::minutes(10)).timestamp();
    client.store.persist(&record).await.unwrap();

    let err = client.api.get::<Value>("/profile").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionExpired);
    assert!(keys_absent(&storage).await);
}

#[tokio::test]
async fn test_server_errors_retried_then_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let client = WalletClient::new(client_config(&server.uri()), local_wallet(), storage.clone()).unwrap();
    let mut record = expired_record();
    record.auth.expires_at = (Utc::now() + Duration::minutes(10)).timestamp();
    client.store.persist(&record).await.unwrap();

    let err = client.api.get::<Value>("/profile").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ServerUnavailable);
    assert_ne!(
        err.code.user_message(),
        ErrorCode::SessionExpired.user_message()
    );
    // Still signed in
    assert!(client.store.load().await.unwrap().is_some());
}

/// Local key wallet whose reported account can be switched, and whose
/// signing can be made to wait forever
struct SwitchableWallet {
    inner: LocalKeyProvider,
    account: Mutex<Option<String>>,
    hang_on_sign: bool,
}

impl SwitchableWallet {
    fn new(hang_on_sign: bool) -> Self {
        Self {
            inner: LocalKeyProvider::new(TEST_KEY, 1).unwrap(),
            account: Mutex::new(None),
            hang_on_sign,
        }
    }

    fn switch_to(&self, address: &str) {
        *self.account.lock().unwrap() = Some(address.to_string());
    }
}

#[async_trait]
impl WalletProvider for SwitchableWallet {
    fn name(&self) -> &str {
        "switchable"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Injected
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn init(&self) -> Result<(), WalletError> {
        Ok(())
    }

    async fn request_accounts(&self) -> Result<Vec<String>, WalletError> {
        let account = self.account.lock().unwrap().clone();
        match account {
            Some(account) => Ok(vec![account]),
            None => self.inner.request_accounts().await,
        }
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        self.inner.chain_id().await
    }

    async fn sign_message(&self, address: &str, message: &str) -> Result<String, WalletError> {
        if self.hang_on_sign {
            std::future::pending::<()>().await;
        }
        self.inner.sign_message(address, message).await
    }
}

#[tokio::test]
async fn test_cancelled_signature_disconnects_wallet() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/nonce"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nonce": "n-1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/verify"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::new());
    let wallet: Arc<dyn WalletProvider> = Arc::new(SwitchableWallet::new(true));
    let client = WalletClient::new(client_config(&server.uri()), vec![wallet], storage.clone()).unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = client.flow.sign_in(&cancel).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UserRejected);
    assert!(err.code.is_cancellation());
    assert!(client.flow.connector().identity().is_none());
    assert!(keys_absent(&storage).await);
}

#[tokio::test]
async fn test_account_switch_ends_session() {
    let (_, router) = test_app();
    let addr = spawn_server(router).await;

    let storage = Arc::new(MemoryStorage::new());
    let wallet = Arc::new(SwitchableWallet::new(false));
    let providers: Vec<Arc<dyn WalletProvider>> = vec![wallet.clone()];
    let client = WalletClient::new(
        client_config(&format!("http://{}", addr)),
        providers,
        storage.clone(),
    )
    .unwrap();

    assert_ok!(client.flow.sign_in(&CancellationToken::new()).await);
    assert_eq!(
        assert_ok!(client.flow.sync_identity().await),
        IdentityChange::Unchanged
    );
    assert!(!keys_absent(&storage).await);

    let other = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";
    wallet.switch_to(other);
    let change = assert_ok!(client.flow.sync_identity().await);
    assert_eq!(
        change,
        IdentityChange::AccountChanged {
            from: TEST_ADDRESS.to_string(),
            to: other.to_string(),
        }
    );
    assert!(keys_absent(&storage).await);
    assert_eq!(client.flow.connector().address().as_deref(), Some(other));
}

#[tokio::test]
async fn test_sign_in_fails_when_newer_session_stored() {
    let (_, router) = test_app();
    let addr = spawn_server(router).await;

    let storage = Arc::new(MemoryStorage::new());
    let client = WalletClient::new(
        client_config(&format!("http://{}", addr)),
        local_wallet(),
        storage.clone(),
    )
    .unwrap();

    // Written by another tab with a clock ahead of ours
    let mut newer = expired_record();
    newer.auth.issued_at = Utc::now() + Duration::minutes(5);
    newer.auth.expires_at = (Utc::now() + Duration::hours(1)).timestamp();
    newer.auth.auth_token = "other-tab".to_string();
    assert!(client.store.persist(&newer).await.unwrap());

    let err = client
        .flow
        .sign_in(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionCreationFailed);
    assert!(client.flow.connector().identity().is_none());

    let stored = client.store.load().await.unwrap().unwrap();
    assert_eq!(stored.auth.auth_token, "other-tab");
}
