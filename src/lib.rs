// lib.rs - Agent Communication Network
//
// Peer nodes that form a DHT over agent addresses, the framed wire protocol
// they speak, and client sessions that register agents and exchange envelopes.

#![doc = include_str!("../README.md")]

pub mod client;
pub mod network;
pub mod node;
pub mod observability;
pub mod proto;
pub mod trust;
pub mod wire;

// Re-export commonly used types
pub use client::{ClientConfig, ClientError, ClientSession, RetryPolicy};

pub use node::{DuplicatePolicy, NodeConfig, NodeError, PeerNode};

pub use wire::{AcnMessage, AgentRecord, CodecError, Envelope, Status, StatusCode};

pub use trust::{LedgerId, LedgerKeyPair, LedgerSigner, PeerKeypair};

pub use observability::{
    MetricsConfig, MetricsHandle, TracingConfig, TracingFormat, init_metrics, init_tracing,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{ClientConfig, ClientError, ClientSession};
    pub use crate::network::{Connector, MemoryConnector, TcpConnector};
    pub use crate::node::{NodeConfig, PeerNode};
    pub use crate::trust::{LedgerId, LedgerKeyPair, LedgerSigner, PeerKeypair};
    pub use crate::wire::{AcnMessage, AgentRecord, Envelope, Status, StatusCode};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
