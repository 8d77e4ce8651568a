//! Wallet authentication
//!
//! - Single-use nonces scoped to a wallet address
//! - Challenge messages with a fixed field order
//! - EIP-191 signature verification
//! - Direct (JWT) and transitional (identity store) session issuance

pub mod challenge;
mod crypto;
mod jwt;
pub mod nonce;
mod service;
pub mod session;

pub use challenge::{build_challenge, ChallengeError, ChallengeMessage};
pub use crypto::{addresses_match, validate_wallet_address, verify_wallet_signature, CryptoError};
pub use jwt::{generate_access_token, generate_refresh_token, verify_token, Claims, JwtError};
pub use nonce::{InMemoryNonceStore, NonceError, NonceRecord, NonceService, NonceStore};
pub use service::{AuthService, ChallengePolicy};
pub use session::{
    HttpIdentityAdmin, IdentityAdmin, IdentityAdminError, JwtSessionIssuer, SessionIssuer,
    TokenService, TransitionalSessionIssuer,
};
