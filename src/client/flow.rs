//! Wallet sign-in orchestration
//!
//! connect -> nonce -> challenge -> sign -> verify -> materialize -> persist
//!
//! Any failure after the wallet connected disconnects it again, so a failed
//! attempt never leaves a half-authenticated client behind.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::auth::{addresses_match, ChallengeMessage};
use crate::error::{AuthError, ErrorCode};
use crate::models::{VerifyRequest, WalletIdentity};

use super::auth_api::AuthApi;
use super::bridge::SessionBridge;
use super::config::ClientConfig;
use super::session_store::{SessionRecord, SessionStore};
use super::wallet::{IdentityChange, WalletConnector};

pub struct WalletAuthFlow {
    auth_domain: String,
    auth_uri: String,
    connector: Arc<WalletConnector>,
    api: AuthApi,
    bridge: SessionBridge,
    store: Arc<SessionStore>,
}

impl WalletAuthFlow {
    pub fn new(
        config: &ClientConfig,
        connector: Arc<WalletConnector>,
        api: AuthApi,
        bridge: SessionBridge,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            auth_domain: config.auth_domain.clone(),
            auth_uri: config.auth_uri.clone(),
            connector,
            api,
            bridge,
            store,
        }
    }

    pub fn connector(&self) -> &Arc<WalletConnector> {
        &self.connector
    }

    /// Run the full sign-in and persist the resulting session
    pub async fn sign_in(&self, cancel: &CancellationToken) -> Result<SessionRecord, AuthError> {
        let identity = match self.connector.identity() {
            Some(identity) => identity,
            None => self.connector.connect_first(cancel).await?,
        };

        match self.authenticate(&identity, cancel).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if e.code.is_cancellation() {
                    tracing::info!(address = %identity.address, "Sign-in cancelled");
                } else {
                    tracing::warn!(address = %identity.address, error = %e, "Sign-in failed");
                }
                self.connector.disconnect().await;
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        identity: &WalletIdentity,
        cancel: &CancellationToken,
    ) -> Result<SessionRecord, AuthError> {
        let grant = self.api.request_nonce(&identity.address).await?;

        let mut challenge = ChallengeMessage::new(
            grant.domain.as_deref().unwrap_or(&self.auth_domain),
            &identity.address,
            identity.chain_id,
            &grant.nonce,
            Utc::now(),
        )
        .with_uri(grant.uri.as_deref().unwrap_or(&self.auth_uri));
        if let Some(statement) = &grant.statement {
            challenge = challenge.with_statement(statement.as_str());
        }
        let message = challenge.build();

        let signature = self.connector.sign(&message, cancel).await?;

        let envelope = self
            .api
            .verify(&VerifyRequest {
                wallet_address: identity.address.clone(),
                signature,
                message,
            })
            .await?;

        let session = self.bridge.materialize(envelope, Utc::now()).await?;
        if !addresses_match(&session.user.wallet_address, &identity.address) {
            return Err(AuthError::with_detail(
                ErrorCode::SessionCreationFailed,
                "session issued for a different wallet",
            ));
        }

        let record = SessionRecord::new(session, identity, Utc::now());
        if !self.store.persist(&record).await? {
            return Err(AuthError::with_detail(
                ErrorCode::SessionCreationFailed,
                "a newer session is already stored",
            ));
        }

        tracing::info!(
            address = %identity.address,
            source = ?record.auth.source,
            expires_at = record.auth.expires_at,
            degraded_nonce = grant.degraded,
            "Wallet signed in"
        );
        Ok(record)
    }

    /// Clear every stored credential and disconnect the wallet
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let result = self.store.clear().await;
        self.connector.disconnect().await;
        result
    }

    /// Re-read the wallet identity; an account switch ends the session
    pub async fn sync_identity(&self) -> Result<IdentityChange, AuthError> {
        let change = self.connector.refresh_identity().await?;
        if let IdentityChange::AccountChanged { from, to } = &change {
            tracing::info!(from = %from, to = %to, "Wallet account changed, clearing session");
            self.store.clear().await?;
        }
        Ok(change)
    }
}
