// trust/ledger.rs - Ledger Scheme Dispatch

use derive_more::Display;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::identity::IdentityError;
use super::{cosmos, ethereum};

/// Ledger whose key, address and signature conventions apply to a record
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerId {
    #[display("fetchai")]
    Fetchai,
    #[display("cosmos")]
    Cosmos,
    #[display("ethereum")]
    Ethereum,
}

impl LedgerId {
    /// All supported ledgers
    pub const ALL: [LedgerId; 3] = [LedgerId::Fetchai, LedgerId::Cosmos, LedgerId::Ethereum];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerId::Fetchai => "fetchai",
            LedgerId::Cosmos => "cosmos",
            LedgerId::Ethereum => "ethereum",
        }
    }

    /// Parse a public key string in this ledger's encoding
    pub fn parse_public_key(&self, public_key: &str) -> Result<PublicKey, IdentityError> {
        match self {
            LedgerId::Fetchai | LedgerId::Cosmos => cosmos::parse_public_key(public_key),
            LedgerId::Ethereum => ethereum::parse_public_key(public_key),
        }
    }

    /// Encode a public key in this ledger's string form
    pub fn encode_public_key(&self, public_key: &PublicKey) -> String {
        match self {
            LedgerId::Fetchai | LedgerId::Cosmos => cosmos::encode_public_key(public_key),
            LedgerId::Ethereum => ethereum::encode_public_key(public_key),
        }
    }

    /// Derive the canonical address of a parsed public key
    pub fn address(&self, public_key: &PublicKey) -> Result<String, IdentityError> {
        match self {
            LedgerId::Fetchai => cosmos::address(cosmos::FETCHAI_HRP, public_key),
            LedgerId::Cosmos => cosmos::address(cosmos::COSMOS_HRP, public_key),
            LedgerId::Ethereum => Ok(ethereum::address(public_key)),
        }
    }

    /// Derive the canonical address of a public key string
    pub fn address_from_public_key(&self, public_key: &str) -> Result<String, IdentityError> {
        let key = self.parse_public_key(public_key)?;
        self.address(&key)
    }

    /// Sign `message` with `secret` using this ledger's hash and signature encoding
    pub fn sign(&self, message: &[u8], secret: &SecretKey) -> String {
        match self {
            LedgerId::Fetchai | LedgerId::Cosmos => cosmos::sign(message, secret),
            LedgerId::Ethereum => ethereum::sign(message, secret),
        }
    }

    /// Verify a signature string over `message`. Malformed inputs verify as false.
    pub fn verify_signature(&self, message: &[u8], signature: &str, public_key: &str) -> bool {
        let Ok(key) = self.parse_public_key(public_key) else {
            return false;
        };
        match self {
            LedgerId::Fetchai | LedgerId::Cosmos => cosmos::verify(message, signature, &key),
            LedgerId::Ethereum => ethereum::verify(message, signature, &key),
        }
    }
}

impl FromStr for LedgerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetchai" => Ok(LedgerId::Fetchai),
            "cosmos" => Ok(LedgerId::Cosmos),
            "ethereum" => Ok(LedgerId::Ethereum),
            other => Err(IdentityError::UnsupportedLedger(other.to_string())),
        }
    }
}
