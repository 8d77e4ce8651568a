//! Wallet Auth Bridge
//!
//! Signature-based wallet authentication with a bridge into a conventional
//! session model: the server half (nonce issuance, challenge verification,
//! session issuance, rate limiting, security monitoring) and the wallet-side
//! client half (connector, session bridge, session store, auth header
//! resolution).

pub mod app_state;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod monitor;
pub mod routes;
