// trust/por.rs - Proof of Representation

//! Checks that an [`AgentRecord`] authorizes a peer to carry traffic for an
//! agent address: the agent signed the peer's public key, and the address is
//! the canonical derivation of the agent's public key.

use thiserror::Error;

use super::ledger::LedgerId;
use crate::wire::{AgentRecord, StatusCode};

/// Which sub-check of a proof of representation failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PorError {
    #[error("Record address {found} does not match expected address {expected}")]
    WrongAgentAddress { expected: String, found: String },

    #[error("Record names peer key {found}, not the representing peer")]
    WrongPublicKey { found: String },

    #[error("Unsupported ledger: {0}")]
    UnsupportedLedger(String),

    #[error("Address {address} is not derived from the record public key")]
    AddressMismatch { address: String },

    #[error("Record public key is invalid: {0}")]
    InvalidPublicKey(String),

    #[error("Signature does not prove representation")]
    InvalidProof,
}

impl PorError {
    /// Status returned to the remote side
    pub fn status_code(&self) -> StatusCode {
        match self {
            PorError::WrongAgentAddress { .. }
            | PorError::AddressMismatch { .. }
            | PorError::InvalidPublicKey(_) => StatusCode::ErrorWrongAgentAddress,
            PorError::WrongPublicKey { .. } => StatusCode::ErrorWrongPublicKey,
            PorError::UnsupportedLedger(_) => StatusCode::ErrorUnsupportedLedger,
            PorError::InvalidProof => StatusCode::ErrorInvalidProof,
        }
    }
}

/// True iff the record is self-consistent: correct address derivation and a
/// valid signature over `peer_public_key`. Never fails.
pub fn verify(record: &AgentRecord) -> bool {
    check_record(record).is_ok()
}

/// Ledger, address derivation and signature checks
pub fn check_record(record: &AgentRecord) -> Result<(), PorError> {
    let ledger: LedgerId = record
        .ledger_id
        .parse()
        .map_err(|_| PorError::UnsupportedLedger(record.ledger_id.clone()))?;

    let derived = ledger
        .address_from_public_key(&record.public_key)
        .map_err(|e| PorError::InvalidPublicKey(e.to_string()))?;
    if derived != record.address {
        return Err(PorError::AddressMismatch {
            address: record.address.clone(),
        });
    }

    if !ledger.verify_signature(
        record.peer_public_key.as_bytes(),
        &record.signature,
        &record.public_key,
    ) {
        return Err(PorError::InvalidProof);
    }
    Ok(())
}

/// Full check used when a record is presented to a peer.
///
/// The record must be for `expected_address` and must name
/// `expected_peer_public_key` as its representative.
pub fn check(
    record: &AgentRecord,
    expected_address: &str,
    expected_peer_public_key: &str,
) -> Result<(), PorError> {
    if record.address != expected_address {
        return Err(PorError::WrongAgentAddress {
            expected: expected_address.to_string(),
            found: record.address.clone(),
        });
    }
    if record.peer_public_key != expected_peer_public_key {
        return Err(PorError::WrongPublicKey {
            found: record.peer_public_key.clone(),
        });
    }
    check_record(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::identity::{LedgerKeyPair, PeerKeypair};
    use proptest::prelude::*;

    fn signed(ledger: LedgerId) -> (AgentRecord, PeerKeypair) {
        let agent = LedgerKeyPair::generate(ledger);
        let peer = PeerKeypair::generate();
        (AgentRecord::issue(&agent, peer.public_key()), peer)
    }

    #[test]
    fn test_valid_record_every_ledger() {
        for ledger in LedgerId::ALL {
            let (record, peer) = signed(ledger);
            assert!(verify(&record), "{} record should verify", ledger);
            assert!(check(&record, &record.address, peer.public_key()).is_ok());
        }
    }

    #[test]
    fn test_check_order_and_codes() {
        let (record, peer) = signed(LedgerId::Fetchai);

        let err = check(&record, "fetch1someoneelse", peer.public_key()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorWrongAgentAddress);

        let other = PeerKeypair::generate();
        let err = check(&record, &record.address, other.public_key()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorWrongPublicKey);

        let mut unknown = record.clone();
        unknown.ledger_id = "dogecoin".into();
        let err = check(&unknown, &record.address, peer.public_key()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ErrorUnsupportedLedger);

        let mut forged = record.clone();
        forged.signature = signed(LedgerId::Fetchai).0.signature;
        let err = check(&forged, &record.address, peer.public_key()).unwrap_err();
        assert_eq!(err, PorError::InvalidProof);
        assert_eq!(err.status_code(), StatusCode::ErrorInvalidProof);
    }

    #[test]
    fn test_address_must_derive_from_public_key() {
        let (mut record, _) = signed(LedgerId::Cosmos);
        let impostor = LedgerKeyPair::generate(LedgerId::Cosmos);
        record.address = impostor.address().to_string();
        assert!(matches!(
            check_record(&record),
            Err(PorError::AddressMismatch { .. })
        ));
    }

    #[test]
    fn test_ethereum_address_is_case_sensitive() {
        let (mut record, _) = signed(LedgerId::Ethereum);
        let lower = record.address.to_lowercase();
        if lower != record.address {
            record.address = lower;
            assert!(!verify(&record));
        }
    }

    fn flip(s: &str, index: usize) -> String {
        let mut bytes = s.as_bytes().to_vec();
        let i = index % bytes.len();
        bytes[i] ^= 0x01;
        String::from_utf8_lossy(&bytes).into_owned()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_single_byte_flip_fails(field in 0usize..4, index in any::<usize>(), ledger in 0usize..3) {
            let (record, _) = signed(LedgerId::ALL[ledger]);
            let mut tampered = record.clone();
            match field {
                0 => tampered.signature = flip(&record.signature, index),
                1 => tampered.public_key = flip(&record.public_key, index),
                2 => tampered.peer_public_key = flip(&record.peer_public_key, index),
                _ => tampered.address = flip(&record.address, index),
            }
            prop_assume!(tampered != record);
            prop_assert!(!verify(&tampered));
        }
    }
}
