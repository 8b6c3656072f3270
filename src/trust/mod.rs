// trust/mod.rs - Identity and Proof of Representation

//! Cryptographic identity for agents and peers.
//!
//! - **Ledgers**: per-ledger key, address and signature conventions
//! - **Identity**: key pairs for agents ([`LedgerKeyPair`]) and peers ([`PeerKeypair`])
//! - **PoR**: verification that a record authorizes a peer to represent an agent
//! - **Store**: persistent agent records using sled
//!
//! # Example
//!
//! ```ignore
//! use acn::trust::*;
//! use acn::wire::AgentRecord;
//!
//! let peer = PeerKeypair::generate();
//! let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
//!
//! let record = AgentRecord::issue(&agent, peer.public_key());
//! assert!(por::verify(&record));
//! ```

mod cosmos;
mod ethereum;
mod identity;
mod ledger;
pub mod por;
mod store;

pub use identity::{
    IdentityError, LedgerKeyPair, LedgerSigner, PeerKeypair, peer_id_from_public_key,
    verify_peer_signature,
};
pub use ledger::LedgerId;
pub use por::PorError;
pub use store::{RecordStore, StoreError};
