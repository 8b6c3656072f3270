// trust/ethereum.rs - Ethereum Scheme

//! Keccak-256 digests with the EIP-191 personal message prefix, EIP-55
//! checksummed addresses and `0x`-prefixed hex encodings.

use secp256k1::{
    Message, PublicKey, SECP256K1, SecretKey,
    ecdsa::{RecoverableSignature, RecoveryId},
};
use tiny_keccak::{Hasher, Keccak};

use super::identity::IdentityError;

/// Keccak-256 hash of the input bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut k = Keccak::v256();
    k.update(data);
    let mut out = [0u8; 32];
    k.finalize(&mut out);
    out
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Parse a `0x` + 64-byte uncompressed public key (no 0x04 marker)
pub fn parse_public_key(public_key: &str) -> Result<PublicKey, IdentityError> {
    let bytes = hex::decode(strip_hex_prefix(public_key))
        .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    if bytes.len() != 64 {
        return Err(IdentityError::InvalidPublicKey(format!(
            "expected 64 bytes, got {}",
            bytes.len()
        )));
    }
    let mut uncompressed = [0u8; 65];
    uncompressed[0] = 0x04;
    uncompressed[1..].copy_from_slice(&bytes);
    PublicKey::from_slice(&uncompressed).map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))
}

pub fn encode_public_key(public_key: &PublicKey) -> String {
    format!("0x{}", hex::encode(&public_key.serialize_uncompressed()[1..]))
}

pub fn address(public_key: &PublicKey) -> String {
    let hash = keccak256(&public_key.serialize_uncompressed()[1..]);
    checksum_address(&hash[12..])
}

/// EIP-55 mixed-case encoding of a 20-byte address
pub fn checksum_address(raw: &[u8]) -> String {
    let lower = hex::encode(raw);
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(2 + lower.len());
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn personal_message_digest(message: &[u8]) -> Message {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    Message::from_digest(keccak256(&prefixed))
}

pub fn sign(message: &[u8], secret: &SecretKey) -> String {
    let signature = SECP256K1.sign_ecdsa_recoverable(&personal_message_digest(message), secret);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut raw = [0u8; 65];
    raw[..64].copy_from_slice(&compact);
    raw[64] = 27 + recovery_id.to_i32() as u8;
    format!("0x{}", hex::encode(raw))
}

/// Recover the public key that produced `signature` over `message`
pub fn recover(message: &[u8], signature: &str) -> Result<PublicKey, IdentityError> {
    let raw = hex::decode(strip_hex_prefix(signature))
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
    if raw.len() != 65 {
        return Err(IdentityError::InvalidSignature(format!(
            "expected 65 bytes, got {}",
            raw.len()
        )));
    }

    let v = raw[64];
    let v = if v >= 27 { v - 27 } else { v };
    let recovery_id = RecoveryId::from_i32(i32::from(v))
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;
    let signature = RecoverableSignature::from_compact(&raw[..64], recovery_id)
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))?;

    SECP256K1
        .recover_ecdsa(&personal_message_digest(message), &signature)
        .map_err(|e| IdentityError::InvalidSignature(e.to_string()))
}

pub fn verify(message: &[u8], signature: &str, public_key: &PublicKey) -> bool {
    match recover(message, signature) {
        Ok(recovered) => address(&recovered) == address(public_key),
        Err(_) => false,
    }
}
