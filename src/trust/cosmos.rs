// trust/cosmos.rs - Cosmos-family Scheme (fetchai, cosmos)

//! secp256k1 keys with SHA-256 message digests.
//!
//! Public keys are hex encoded compressed points, addresses are
//! `bech32(hrp, ripemd160(sha256(pubkey)))` and signatures are the base64
//! encoding of the 64-byte compact `r || s` form.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bech32::{Bech32, Hrp};
use ripemd::Ripemd160;
use secp256k1::{Message, PublicKey, SECP256K1, SecretKey, ecdsa::Signature};
use sha2::{Digest, Sha256};

use super::identity::IdentityError;

/// Human-readable address prefix for fetchai
pub const FETCHAI_HRP: &str = "fetch";

/// Human-readable address prefix for cosmos
pub const COSMOS_HRP: &str = "cosmos";

pub fn parse_public_key(public_key: &str) -> Result<PublicKey, IdentityError> {
    let bytes =
        hex::decode(public_key).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    PublicKey::from_slice(&bytes).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

pub fn encode_public_key(public_key: &PublicKey) -> String {
    hex::encode(public_key.serialize())
}

pub fn address(hrp: &str, public_key: &PublicKey) -> Result<String, IdentityError> {
    let sha = Sha256::digest(public_key.serialize());
    let ripe = Ripemd160::digest(sha);
    let hrp = Hrp::parse(hrp).map_err(|e| IdentityError::Address(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &ripe[..]).map_err(|e| IdentityError::Address(e.to_string()))
}

fn digest(message: &[u8]) -> Message {
    Message::from_digest(Sha256::digest(message).into())
}

pub fn sign(message: &[u8], secret: &SecretKey) -> String {
    let signature = SECP256K1.sign_ecdsa(&digest(message), secret);
    BASE64.encode(signature.serialize_compact())
}

pub fn verify(message: &[u8], signature: &str, public_key: &PublicKey) -> bool {
    let Ok(raw) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_compact(&raw) else {
        return false;
    };
    signature.normalize_s();
    SECP256K1
        .verify_ecdsa(&digest(message), &signature, public_key)
        .is_ok()
}
