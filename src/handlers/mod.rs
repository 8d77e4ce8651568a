//! API handlers for the wallet auth server

pub mod auth;
pub mod security;

pub use auth::*;
pub use security::*;

// Re-export the bearer extractor for handler use
pub use crate::middleware::auth::AuthenticatedWallet;
