//! Data models shared by the auth server and the wallet client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod auth;
pub use auth::*;

/// Namespace for wallet-derived user ids
const WALLET_USER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93d4_4b0a_9e55_0c3d_8a21_f4b7);

/// A user identified by their wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletUser {
    pub id: Uuid,
    pub wallet_address: String,
    pub email: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl WalletUser {
    /// Build the user record for a (lowercase) wallet address.
    ///
    /// The id is derived from the address, so the same wallet always maps to
    /// the same user without a lookup.
    pub fn for_wallet(address: &str, now: DateTime<Utc>) -> Self {
        let address = address.to_lowercase();
        let suffix = &address[address.len().saturating_sub(6)..];
        Self {
            id: Uuid::new_v5(&WALLET_USER_NAMESPACE, address.as_bytes()),
            display_name: format!("Web3User{}", suffix),
            wallet_address: address,
            email: None,
            created_at: now,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// How a user authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Web3,
    Password,
}

/// User response (sanitized for API)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub wallet_address: String,
    pub email: Option<String>,
    pub display_name: String,
    pub auth_method: AuthMethod,
    pub created_at: DateTime<Utc>,
}

impl From<WalletUser> for UserResponse {
    fn from(user: WalletUser) -> Self {
        Self {
            id: user.id,
            wallet_address: user.wallet_address,
            email: user.email,
            display_name: user.display_name,
            auth_method: AuthMethod::Web3,
            created_at: user.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_user_is_stable_per_address() {
        let now = Utc::now();
        let a = WalletUser::for_wallet("0xF39Fd6e51aad88F6F4ce6aB8827279cffFb92266", now);
        let b = WalletUser::for_wallet("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", now);
        assert_eq!(a.id, b.id);
        assert_eq!(a.wallet_address, "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        assert_eq!(a.display_name, "Web3Userb92266");
    }
}
