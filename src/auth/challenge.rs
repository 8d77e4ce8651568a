//! Sign-in challenge messages
//!
//! The challenge is a fixed text template in the style of Sign-In with
//! Ethereum. Field order is fixed (domain, address, statement, URI, version,
//! chain id, nonce, issued-at) so the server can parse back exactly what the
//! wallet signed.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";
const VERSION: &str = "1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("Malformed challenge: {0}")]
    Malformed(String),

    #[error("Missing challenge field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported challenge version: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid chain id: {0}")]
    InvalidChainId(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Parsed or to-be-signed challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub domain: String,
    pub address: String,
    pub statement: String,
    pub uri: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
}

impl ChallengeMessage {
    pub fn new(
        domain: impl Into<String>,
        address: impl Into<String>,
        chain_id: u64,
        nonce: impl Into<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let domain = domain.into();
        Self {
            uri: format!("https://{}", domain),
            domain,
            address: address.into(),
            statement: "Sign in with your wallet.".to_string(),
            chain_id,
            nonce: nonce.into(),
            issued_at,
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = statement.into();
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Render the text the wallet signs
    pub fn build(&self) -> String {
        self.to_string()
    }

    /// Parse a challenge previously produced by [`ChallengeMessage::build`]
    pub fn parse(text: &str) -> Result<Self, ChallengeError> {
        let text = text.replace("\r\n", "\n");
        let mut lines = text.lines();

        let domain = lines
            .next()
            .and_then(|l| l.strip_suffix(HEADER_SUFFIX))
            .filter(|d| !d.is_empty())
            .ok_or(ChallengeError::MissingField("domain"))?
            .to_string();

        let address = lines
            .next()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(ChallengeError::MissingField("address"))?
            .to_string();

        if lines.next() != Some("") {
            return Err(ChallengeError::Malformed(
                "expected blank line after address".to_string(),
            ));
        }

        let mut next = lines.next();
        let mut statement = String::new();
        if let Some(line) = next {
            if !line.starts_with("URI: ") {
                statement = line.to_string();
                if lines.next() != Some("") {
                    return Err(ChallengeError::Malformed(
                        "expected blank line after statement".to_string(),
                    ));
                }
                next = lines.next();
            }
        }

        let uri = field(next, "URI", "uri")?.to_string();

        let version = field(lines.next(), "Version", "version")?;
        if version != VERSION {
            return Err(ChallengeError::UnsupportedVersion(version.to_string()));
        }

        let chain_id = field(lines.next(), "Chain ID", "chain id")?;
        let chain_id = chain_id
            .parse::<u64>()
            .map_err(|_| ChallengeError::InvalidChainId(chain_id.to_string()))?;

        let nonce = field(lines.next(), "Nonce", "nonce")?.to_string();
        if nonce.is_empty() {
            return Err(ChallengeError::MissingField("nonce"));
        }

        let issued_at = field(lines.next(), "Issued At", "issued at")?;
        let issued_at = DateTime::parse_from_rfc3339(issued_at)
            .map_err(|_| ChallengeError::InvalidTimestamp(issued_at.to_string()))?
            .with_timezone(&Utc);

        if lines.any(|l| !l.trim().is_empty()) {
            return Err(ChallengeError::Malformed(
                "unexpected trailing content".to_string(),
            ));
        }

        Ok(Self {
            domain,
            address,
            statement,
            uri,
            chain_id,
            nonce,
            issued_at,
        })
    }
}

fn field<'a>(
    line: Option<&'a str>,
    key: &str,
    name: &'static str,
) -> Result<&'a str, ChallengeError> {
    line.and_then(|l| l.strip_prefix(key))
        .and_then(|l| l.strip_prefix(": "))
        .map(str::trim)
        .ok_or(ChallengeError::MissingField(name))
}

impl fmt::Display for ChallengeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}{}", self.domain, HEADER_SUFFIX)?;
        writeln!(f, "{}", self.address)?;
        writeln!(f)?;
        if !self.statement.is_empty() {
            writeln!(f, "{}", self.statement)?;
            writeln!(f)?;
        }
        writeln!(f, "URI: {}", self.uri)?;
        writeln!(f, "Version: {}", VERSION)?;
        writeln!(f, "Chain ID: {}", self.chain_id)?;
        writeln!(f, "Nonce: {}", self.nonce)?;
        write!(
            f,
            "Issued At: {}",
            self.issued_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Render a challenge with the default statement and URI
pub fn build_challenge(
    domain: &str,
    address: &str,
    chain_id: u64,
    nonce: &str,
    issued_at: DateTime<Utc>,
) -> String {
    ChallengeMessage::new(domain, address, chain_id, nonce, issued_at).build()
}
