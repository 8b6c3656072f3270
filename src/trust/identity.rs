// trust/identity.rs - Agent and Peer Key Pairs

use libp2p::PeerId;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use std::fmt;
use thiserror::Error;

use super::ledger::LedgerId;

/// Errors related to identity operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Address derivation failed: {0}")]
    Address(String),

    #[error("Unsupported ledger: {0}")]
    UnsupportedLedger(String),
}

/// Signing capability supplied by a wallet.
///
/// The ACN core never sees key material through this trait, only the public
/// key, the derived address and signatures.
pub trait LedgerSigner: Send + Sync {
    /// Ledger whose conventions the signer follows
    fn ledger_id(&self) -> LedgerId;

    /// Public key in the ledger's string encoding
    fn public_key(&self) -> String;

    /// Address derived from the public key
    fn address(&self) -> String;

    /// Sign arbitrary bytes, returning the ledger's signature encoding
    fn sign(&self, message: &[u8]) -> String;
}

/// A secp256k1 key pair bound to one ledger's conventions
#[derive(Clone)]
pub struct LedgerKeyPair {
    ledger: LedgerId,
    secret: SecretKey,
    public: PublicKey,
    address: String,
}

impl LedgerKeyPair {
    /// Generate a new random key pair
    pub fn generate(ledger: LedgerId) -> Self {
        let mut rng = rand::rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // Out-of-range scalars are astronomically rare; draw again
            if let Ok(secret) = SecretKey::from_slice(&bytes) {
                if let Ok(keys) = Self::from_secret_key(ledger, secret) {
                    return keys;
                }
            }
        }
    }

    /// Create from a parsed secret key
    pub fn from_secret_key(ledger: LedgerId, secret: SecretKey) -> Result<Self, IdentityError> {
        let public = PublicKey::from_secret_key_global(&secret);
        let address = ledger.address(&public)?;
        Ok(Self {
            ledger,
            secret,
            public,
            address,
        })
    }

    /// Create from a hex encoded 32-byte secret (an optional `0x` prefix is accepted)
    pub fn from_secret_hex(ledger: LedgerId, secret_hex: &str) -> Result<Self, IdentityError> {
        let trimmed = secret_hex.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| IdentityError::InvalidSecretKey(e.to_string()))?;
        Self::from_secret_key(ledger, secret)
    }

    pub fn ledger(&self) -> LedgerId {
        self.ledger
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Hex of the secret key (be careful with this!)
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    pub fn public_key_string(&self) -> String {
        self.ledger.encode_public_key(&self.public)
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl LedgerSigner for LedgerKeyPair {
    fn ledger_id(&self) -> LedgerId {
        self.ledger
    }

    fn public_key(&self) -> String {
        self.public_key_string()
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, message: &[u8]) -> String {
        self.ledger.sign(message, &self.secret)
    }
}

impl fmt::Debug for LedgerKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerKeyPair")
            .field("ledger", &self.ledger)
            .field("address", &self.address)
            .finish()
    }
}

/// Identity of a peer node.
///
/// The public key string uses the fetchai encoding (hex compressed point),
/// which is what agents sign when they authorize a peer to represent them.
#[derive(Clone)]
pub struct PeerKeypair {
    keys: LedgerKeyPair,
    public_key: String,
    peer_id: PeerId,
}

impl PeerKeypair {
    pub fn generate() -> Self {
        let keys = LedgerKeyPair::generate(LedgerId::Fetchai);
        Self::from_keys(keys).unwrap_or_else(|_| Self::generate())
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, IdentityError> {
        Self::from_keys(LedgerKeyPair::from_secret_hex(LedgerId::Fetchai, secret_hex)?)
    }

    fn from_keys(keys: LedgerKeyPair) -> Result<Self, IdentityError> {
        let public_key = keys.public_key_string();
        let peer_id = peer_id_from_public_key(&public_key)?;
        Ok(Self {
            keys,
            public_key,
            peer_id,
        })
    }

    /// Hex encoded compressed public key
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn secret_hex(&self) -> String {
        self.keys.secret_hex()
    }

    /// Sign with the peer key, in the fetchai signature encoding
    pub fn sign(&self, message: &[u8]) -> String {
        self.keys.sign(message)
    }
}

/// Check a signature made by [`PeerKeypair::sign`]
pub fn verify_peer_signature(public_key: &str, message: &[u8], signature: &str) -> bool {
    LedgerId::Fetchai.verify_signature(message, signature, public_key)
}

impl fmt::Debug for PeerKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKeypair")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Derive the libp2p peer id of a hex encoded compressed secp256k1 key
pub fn peer_id_from_public_key(public_key: &str) -> Result<PeerId, IdentityError> {
    let bytes =
        hex::decode(public_key).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    let key = libp2p::identity::secp256k1::PublicKey::try_from_bytes(&bytes)
        .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    Ok(libp2p::identity::PublicKey::from(key).to_peer_id())
}
