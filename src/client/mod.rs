//! Wallet-side client
//!
//! Connects a wallet, signs the server's challenge, turns the verify result
//! into a persisted session and resolves credentials for later API calls.

mod auth_api;
mod bridge;
mod config;
mod flow;
mod http;
mod identity;
mod resolver;
mod session_store;
pub mod storage;
pub mod wallet;

use std::sync::Arc;

use crate::error::AuthError;

pub use auth_api::{AuthApi, NonceGrant};
pub use bridge::{SessionBridge, SessionSource, VerifiedSession};
pub use config::ClientConfig;
pub use flow::WalletAuthFlow;
pub use http::{ApiClient, RetrySettings};
pub use identity::{HttpIdentityStore, IdentityStore};
pub use resolver::{AuthHeaderResolver, ConventionalSessionSource, CredentialSource, ResolvedAuth};
pub use session_store::{
    ConventionalSession, SessionRecord, SessionStore, SessionStoreError, WalletAuthRecord,
    WalletSessionMarker,
};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use wallet::{
    IdentityChange, LocalKeyProvider, ProviderHandle, ProviderKind, WalletConnector, WalletError,
    WalletProvider,
};

/// Fully wired client
pub struct WalletClient {
    pub flow: WalletAuthFlow,
    pub api: ApiClient,
    pub resolver: Arc<AuthHeaderResolver>,
    pub store: Arc<SessionStore>,
}

impl WalletClient {
    pub fn new(
        config: ClientConfig,
        providers: Vec<Arc<dyn WalletProvider>>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self, AuthError> {
        let identity: Arc<dyn IdentityStore> = Arc::new(HttpIdentityStore::new(&config)?);
        Self::with_identity_store(config, providers, storage, identity)
    }

    pub fn with_identity_store(
        config: ClientConfig,
        providers: Vec<Arc<dyn WalletProvider>>,
        storage: Arc<dyn KeyValueStorage>,
        identity: Arc<dyn IdentityStore>,
    ) -> Result<Self, AuthError> {
        let store = Arc::new(SessionStore::new(
            storage,
            identity.clone(),
            &config.storage_namespace,
        ));
        let resolver = Arc::new(AuthHeaderResolver::new(
            store.clone(),
            store.clone(),
            config.public_prefixes.clone(),
        ));
        let api = ApiClient::new(&config, resolver.clone(), store.clone())?;

        let connector = Arc::new(WalletConnector::new(
            providers,
            config.wallet_init_timeout,
            RetrySettings::from_config(&config),
        ));
        let flow = WalletAuthFlow::new(
            &config,
            connector,
            AuthApi::new(&config)?,
            SessionBridge::new(identity),
            store.clone(),
        );

        Ok(Self {
            flow,
            api,
            resolver,
            store,
        })
    }
}
