//! Wallet address validation and signature verification
//!
//! Signatures are EIP-191 `personal_sign` signatures over the challenge text:
//! 65 bytes `r || s || v`, hex encoded. Verification recovers the signer and
//! compares it with the claimed address.

use std::str::FromStr;

use alloy_primitives::{Address, Signature};
use thiserror::Error;

/// Errors that can occur during address validation or signature verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid wallet address format: {0}")]
    InvalidAddressFormat(String),

    #[error("Invalid address checksum")]
    InvalidChecksum,

    #[error("Address is not allowed: {0}")]
    SuspiciousAddress(String),

    #[error("Invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    #[error("Signer recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Well-known burn addresses nobody can sign for
const BURN_ADDRESSES: [&str; 2] = [
    "0x000000000000000000000000000000000000dead",
    "0xdead000000000000000042069420694206942069",
];

/// Validate a wallet address and return it lowercased.
///
/// Mixed-case input must carry a valid EIP-55 checksum. Placeholder and burn
/// addresses are rejected.
pub fn validate_wallet_address(address: &str) -> Result<String, CryptoError> {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| CryptoError::InvalidAddressFormat("missing 0x prefix".to_string()))?;

    if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CryptoError::InvalidAddressFormat(
            "expected 40 hex characters".to_string(),
        ));
    }

    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    if has_upper && has_lower {
        Address::parse_checksummed(format!("0x{}", body), None)
            .map_err(|_| CryptoError::InvalidChecksum)?;
    }

    let normalized = format!("0x{}", body.to_lowercase());
    if is_suspicious(&normalized) {
        return Err(CryptoError::SuspiciousAddress(normalized));
    }

    Ok(normalized)
}

fn is_suspicious(normalized: &str) -> bool {
    let body = &normalized[2..];
    let first = body.as_bytes()[0];
    body.bytes().all(|b| b == first) || BURN_ADDRESSES.contains(&normalized)
}

/// Case-insensitive address comparison
pub fn addresses_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Verify that `signature` over `message` was produced by `address`
pub fn verify_wallet_signature(
    address: &str,
    message: &str,
    signature: &str,
) -> Result<(), CryptoError> {
    let expected = Address::from_str(address.trim())
        .map_err(|e| CryptoError::InvalidAddressFormat(e.to_string()))?;

    let signature = decode_signature(signature)?;

    let recovered = signature
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;

    if recovered != expected {
        tracing::debug!(
            expected = %expected,
            recovered = %recovered,
            "Recovered signer does not match claimed address"
        );
        return Err(CryptoError::VerificationFailed);
    }

    Ok(())
}

fn decode_signature(signature: &str) -> Result<Signature, CryptoError> {
    let trimmed = signature.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    let bytes =
        hex::decode(hex_part).map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))?;

    if bytes.len() != 65 {
        return Err(CryptoError::InvalidSignatureFormat(format!(
            "expected 65 bytes, got {}",
            bytes.len()
        )));
    }

    Signature::try_from(bytes.as_slice())
        .map_err(|e| CryptoError::InvalidSignatureFormat(e.to_string()))
}
