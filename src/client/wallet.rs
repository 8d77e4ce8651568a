//! Wallet providers and the connector that drives them
//!
//! Providers are discovered in a fixed priority order, injected providers
//! first and remote pairing last. Initialization is bounded; waiting for the
//! user to approve accounts or sign is not, but it can always be cancelled.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::auth::validate_wallet_address;
use crate::error::{AuthError, ErrorCode};
use crate::models::WalletIdentity;

use super::http::{with_retry, RetrySettings};

/// Wallet interaction failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("User rejected the request")]
    UserRejected,

    #[error("Wallet not installed: {0}")]
    NotInstalled(String),

    #[error("Wallet did not respond in time")]
    Timeout,

    #[error("Wallet transport failed: {0}")]
    Transport(String),

    #[error("Wallet returned no accounts")]
    NoAccounts,

    #[error("Wallet interaction cancelled")]
    Cancelled,

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl From<WalletError> for AuthError {
    fn from(err: WalletError) -> Self {
        let code = match &err {
            WalletError::UserRejected | WalletError::Cancelled => ErrorCode::UserRejected,
            WalletError::NotInstalled(_) => ErrorCode::WalletNotInstalled,
            WalletError::Timeout => ErrorCode::WalletTimeout,
            WalletError::Transport(_) => ErrorCode::NetworkError,
            WalletError::NoAccounts => ErrorCode::WalletAddressInvalid,
            WalletError::Signing(_) => ErrorCode::SignatureInvalid,
        };
        AuthError::with_detail(code, err.to_string())
    }
}

/// Discovery priority; earlier variants are tried first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProviderKind {
    Injected,
    RemotePairing,
}

/// A wallet implementation
#[async_trait]
pub trait WalletProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn is_available(&self) -> bool;

    /// Prepare the provider (load SDK, open pairing channel)
    async fn init(&self) -> Result<(), WalletError>;

    /// Ask the user to expose accounts; may wait on the user indefinitely
    async fn request_accounts(&self) -> Result<Vec<String>, WalletError>;

    async fn chain_id(&self) -> Result<u64, WalletError>;

    /// EIP-191 `personal_sign`; may wait on the user indefinitely
    async fn sign_message(&self, address: &str, message: &str) -> Result<String, WalletError>;

    async fn disconnect(&self) -> Result<(), WalletError> {
        Ok(())
    }
}

/// Capability handle returned by discovery
#[derive(Clone)]
pub struct ProviderHandle {
    pub name: String,
    pub kind: ProviderKind,
    provider: Arc<dyn WalletProvider>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// What changed when the wallet's identity was re-read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    Unchanged,
    ChainChanged { from: u64, to: u64 },
    AccountChanged { from: String, to: String },
}

struct ActiveWallet {
    provider: Arc<dyn WalletProvider>,
    identity: WalletIdentity,
}

pub struct WalletConnector {
    providers: Vec<Arc<dyn WalletProvider>>,
    init_timeout: Duration,
    retry: RetrySettings,
    active: Mutex<Option<ActiveWallet>>,
}

impl WalletConnector {
    pub fn new(
        providers: Vec<Arc<dyn WalletProvider>>,
        init_timeout: Duration,
        retry: RetrySettings,
    ) -> Self {
        Self {
            providers,
            init_timeout,
            retry,
            active: Mutex::new(None),
        }
    }

    /// Available providers, injected before remote pairing
    pub async fn discover(&self) -> Vec<ProviderHandle> {
        let mut handles = Vec::new();
        for provider in &self.providers {
            if provider.is_available().await {
                handles.push(ProviderHandle {
                    name: provider.name().to_string(),
                    kind: provider.kind(),
                    provider: provider.clone(),
                });
            }
        }
        handles.sort_by_key(|h| h.kind);
        tracing::debug!(count = handles.len(), "Discovered wallet providers");
        handles
    }

    /// Connect through `handle` and remember the resulting identity
    pub async fn connect(
        &self,
        handle: &ProviderHandle,
        cancel: &CancellationToken,
    ) -> Result<WalletIdentity, AuthError> {
        let provider = handle.provider.clone();

        let init = with_retry(self.retry, "wallet init", || {
            let provider = provider.clone();
            let timeout = self.init_timeout;
            async move {
                match tokio::time::timeout(timeout, provider.init()).await {
                    Ok(result) => result.map_err(AuthError::from),
                    Err(_) => Err(WalletError::Timeout.into()),
                }
            }
        });
        cancellable(cancel, init).await?;

        let accounts = cancellable(cancel, async {
            provider.request_accounts().await.map_err(AuthError::from)
        })
        .await?;
        let account = accounts.first().ok_or(WalletError::NoAccounts)?;
        let address = validate_wallet_address(account)
            .map_err(|e| AuthError::with_detail(ErrorCode::WalletAddressInvalid, e.to_string()))?;
        let chain_id = provider.chain_id().await?;

        let identity = WalletIdentity {
            address,
            chain_id,
            provider_name: handle.name.clone(),
        };
        tracing::info!(
            provider = %identity.provider_name,
            address = %identity.address,
            chain_id,
            "Wallet connected"
        );

        self.set_active(Some(ActiveWallet {
            provider,
            identity: identity.clone(),
        }))?;
        Ok(identity)
    }

    /// Connect through the first provider that works.
    ///
    /// A user rejection or cancellation stops the search; other failures
    /// move on to the next provider.
    pub async fn connect_first(&self, cancel: &CancellationToken) -> Result<WalletIdentity, AuthError> {
        let handles = self.discover().await;
        let mut last_error = AuthError::with_detail(ErrorCode::WalletNotInstalled, "no wallet provider available");

        for handle in &handles {
            match self.connect(handle, cancel).await {
                Ok(identity) => return Ok(identity),
                Err(e) if e.code.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(provider = %handle.name, error = %e, "Wallet provider failed, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn identity(&self) -> Option<WalletIdentity> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|a| a.identity.clone()))
    }

    /// Address of the connected account
    pub fn address(&self) -> Option<String> {
        self.identity().map(|identity| identity.address)
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.identity().map(|identity| identity.chain_id)
    }

    /// Ask the connected wallet to sign `message`
    pub async fn sign(&self, message: &str, cancel: &CancellationToken) -> Result<String, AuthError> {
        let (provider, address) = self.active_provider()?;
        cancellable(cancel, async {
            provider
                .sign_message(&address, message)
                .await
                .map_err(AuthError::from)
        })
        .await
    }

    /// Re-read account and chain from the connected wallet
    pub async fn refresh_identity(&self) -> Result<IdentityChange, AuthError> {
        let (provider, previous) = {
            let active = self
                .active
                .lock()
                .map_err(|_| AuthError::new(ErrorCode::InternalServerError))?;
            let active = active.as_ref().ok_or_else(not_connected)?;
            (active.provider.clone(), active.identity.clone())
        };

        let accounts = provider.request_accounts().await?;
        let account = accounts.first().ok_or(WalletError::NoAccounts)?;
        let address = validate_wallet_address(account)
            .map_err(|e| AuthError::with_detail(ErrorCode::WalletAddressInvalid, e.to_string()))?;
        let chain_id = provider.chain_id().await?;

        let change = if address != previous.address {
            IdentityChange::AccountChanged {
                from: previous.address.clone(),
                to: address.clone(),
            }
        } else if chain_id != previous.chain_id {
            IdentityChange::ChainChanged {
                from: previous.chain_id,
                to: chain_id,
            }
        } else {
            IdentityChange::Unchanged
        };

        if change != IdentityChange::Unchanged {
            tracing::info!(?change, "Wallet identity changed");
            self.set_active(Some(ActiveWallet {
                provider,
                identity: WalletIdentity {
                    address,
                    chain_id,
                    provider_name: previous.provider_name,
                },
            }))?;
        }
        Ok(change)
    }

    pub async fn disconnect(&self) {
        let active = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        if let Some(active) = active {
            if let Err(e) = active.provider.disconnect().await {
                tracing::warn!(provider = %active.identity.provider_name, error = %e, "Wallet disconnect failed");
            }
            tracing::info!(address = %active.identity.address, "Wallet disconnected");
        }
    }

    fn active_provider(&self) -> Result<(Arc<dyn WalletProvider>, String), AuthError> {
        let active = self
            .active
            .lock()
            .map_err(|_| AuthError::new(ErrorCode::InternalServerError))?;
        let active = active.as_ref().ok_or_else(not_connected)?;
        Ok((active.provider.clone(), active.identity.address.clone()))
    }

    fn set_active(&self, wallet: Option<ActiveWallet>) -> Result<(), AuthError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| AuthError::new(ErrorCode::InternalServerError))?;
        *active = wallet;
        Ok(())
    }
}

fn not_connected() -> AuthError {
    AuthError::with_detail(ErrorCode::AuthenticationRequired, "no wallet connected")
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, AuthError>>,
) -> Result<T, AuthError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WalletError::Cancelled.into()),
        result = fut => result,
    }
}

/// Provider backed by a local private key
pub struct LocalKeyProvider {
    signer: PrivateKeySigner,
    chain_id: u64,
}

impl LocalKeyProvider {
    pub fn new(private_key_hex: &str, chain_id: u64) -> Result<Self, WalletError> {
        let key = private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex);
        let signer = PrivateKeySigner::from_str(key)
            .map_err(|e| WalletError::NotInstalled(format!("invalid private key: {}", e)))?;
        Ok(Self { signer, chain_id })
    }

    pub fn random(chain_id: u64) -> Self {
        Self {
            signer: PrivateKeySigner::random(),
            chain_id,
        }
    }

    pub fn address(&self) -> String {
        self.signer.address().to_checksum(None)
    }
}

#[async_trait]
impl WalletProvider for LocalKeyProvider {
    fn name(&self) -> &str {
        "local-key"
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
        Ok(vec![self.address()])
    }

    async fn chain_id(&self) -> Result<u64, WalletError> {
        Ok(self.chain_id)
    }

    async fn sign_message(&self, address: &str, message: &str) -> Result<String, WalletError> {
        if !address.eq_ignore_ascii_case(&self.address()) {
            return Err(WalletError::Signing(format!("unknown account {}", address)));
        }
        let signature = self
            .signer
            .sign_message_sync(message.as_bytes())
            .map_err(|e| WalletError::Signing(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verify_wallet_signature;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    struct StubProvider {
        name: &'static str,
        kind: ProviderKind,
        available: bool,
        init_failures: u32,
        init_calls: AtomicU32,
        reject_accounts: bool,
    }

    impl StubProvider {
        fn new(name: &'static str, kind: ProviderKind) -> Self {
            Self {
                name,
                kind,
                available: true,
                init_failures: 0,
                init_calls: AtomicU32::new(0),
                reject_accounts: false,
            }
        }
    }

    #[async_trait]
    impl WalletProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn init(&self) -> Result<(), WalletError> {
            if self.init_calls.fetch_add(1, Ordering::SeqCst) < self.init_failures {
                return Err(WalletError::Timeout);
            }
            Ok(())
        }

        async fn request_accounts(&self) -> Result<Vec<String>, WalletError> {
            if self.reject_accounts {
                return Err(WalletError::UserRejected);
            }
            Ok(vec!["0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string()])
        }

        async fn chain_id(&self) -> Result<u64, WalletError> {
            Ok(1)
        }

        async fn sign_message(&self, _: &str, _: &str) -> Result<String, WalletError> {
            std::future::pending().await
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn connector(providers: Vec<Arc<dyn WalletProvider>>) -> WalletConnector {
        WalletConnector::new(providers, Duration::from_secs(1), fast_retry())
    }

    #[tokio::test]
    async fn test_discover_orders_injected_first() {
        let mut hidden = StubProvider::new("hidden", ProviderKind::Injected);
        hidden.available = false;
        let connector = connector(vec![
            Arc::new(StubProvider::new("pairing", ProviderKind::RemotePairing)),
            Arc::new(hidden),
            Arc::new(StubProvider::new("browser", ProviderKind::Injected)),
        ]);

        let names: Vec<_> = connector
            .discover()
            .await
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["browser", "pairing"]);
    }

    #[tokio::test]
    async fn test_init_timeouts_are_retried() {
        let mut flaky = StubProvider::new("browser", ProviderKind::Injected);
        flaky.init_failures = 2;
        let flaky = Arc::new(flaky);
        let connector = connector(vec![flaky.clone()]);

        let identity = connector
            .connect_first(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identity.address, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert_eq!(flaky.init_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_stops_provider_search() {
        let mut rejecting = StubProvider::new("browser", ProviderKind::Injected);
        rejecting.reject_accounts = true;
        let pairing = Arc::new(StubProvider::new("pairing", ProviderKind::RemotePairing));
        let connector = connector(vec![Arc::new(rejecting), pairing.clone()]);

        let err = connector
            .connect_first(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UserRejected);
        assert_eq!(pairing.init_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_provider_is_not_installed() {
        let err = connector(vec![])
            .connect_first(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WalletNotInstalled);
    }

    #[tokio::test]
    async fn test_pending_signature_is_cancellable() {
        let connector = connector(vec![Arc::new(StubProvider::new("browser", ProviderKind::Injected))]);
        let cancel = CancellationToken::new();
        connector.connect_first(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = connector.sign("hello", &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UserRejected);
        assert!(err.code.is_cancellation());
    }

    #[tokio::test]
    async fn test_local_key_signature_verifies() {
        let provider = Arc::new(LocalKeyProvider::new(TEST_KEY, 56).unwrap());
        let connector = connector(vec![provider]);
        let identity = connector
            .connect_first(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(identity.chain_id, 56);
        assert_eq!(identity.provider_name, "local-key");
        assert_eq!(connector.chain_id(), Some(56));
        assert_eq!(connector.address().as_deref(), Some(identity.address.as_str()));

        let signature = connector
            .sign("hello", &CancellationToken::new())
            .await
            .unwrap();
        assert!(verify_wallet_signature(&identity.address, "hello", &signature).is_ok());
    }

    #[tokio::test]
    async fn test_sign_requires_connection() {
        let err = connector(vec![])
            .sign("hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationRequired);
    }

    #[tokio::test]
    async fn test_disconnect_forgets_identity() {
        let connector = connector(vec![Arc::new(LocalKeyProvider::random(1))]);
        connector
            .connect_first(&CancellationToken::new())
            .await
            .unwrap();
        assert!(connector.identity().is_some());

        connector.disconnect().await;
        assert!(connector.identity().is_none());
        assert_eq!(
            connector.refresh_identity().await.unwrap_err().code,
            ErrorCode::AuthenticationRequired
        );
    }
}
