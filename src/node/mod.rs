// node/mod.rs - ACN Peer Node

//! The long-running peer node.
//!
//! A node binds one TCP listener for peer streams (DHT RPC, envelope
//! forwarding, address lookup and relay registration) and optionally a
//! delegate listener for lightweight clients. Every accepted connection runs
//! on its own task; they coordinate only through [`NodeState`].
//!
//! ```ignore
//! let node = PeerNode::start(NodeConfig::local()).await?;
//! println!("peer address: {}", node.multiaddr());
//! node.shutdown().await;
//! ```

pub mod config;
mod registration;
mod router;
mod service;
mod session;
mod state;

#[cfg(test)]
mod tests;

pub use config::{DhtSettings, DuplicatePolicy, NodeConfig, TimeoutConfig};
pub use registration::{RegistrationState, verify_registration};
pub use state::{
    DeliveryError, NodeState, RecordBook, Resolution, ServiceKind, SessionHandle, SessionInsert,
    SessionRegistry,
};

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::transport::socket_multiaddr;
use crate::network::{BoxedStream, Dht, DiscoveryError, RoutingTableEntry, TransportError};
use crate::trust::{IdentityError, PeerKeypair, RecordStore, StoreError};
use crate::wire::{AgentRecord, Envelope, Status};

/// Errors raised while running a peer node
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unknown agent address: {0}")]
    UnknownAddress(String),
}

/// A running peer node
pub struct PeerNode {
    state: Arc<NodeState>,
    p2p_addr: SocketAddr,
    delegate_addr: Option<SocketAddr>,
    public_addr: Multiaddr,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerNode {
    /// Bind listeners, restore persisted records, join the DHT and publish
    /// restored addresses.
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let keys = match &config.peer_key {
            Some(secret) => PeerKeypair::from_secret_hex(secret)?,
            None => PeerKeypair::generate(),
        };

        let p2p_listener = TcpListener::bind(config.p2p_listen).await?;
        let p2p_addr = p2p_listener.local_addr()?;
        let public_addr = match &config.public_address {
            Some(addr) => addr
                .parse::<Multiaddr>()
                .map_err(|e| NodeError::Config(e.to_string()))?,
            None => socket_multiaddr(p2p_addr),
        };

        let local = RoutingTableEntry::new(keys.peer_id(), keys.public_key(), vec![public_addr.clone()]);
        let dht = Dht::new(local, config.discovery()?);
        let store = match &config.record_store_path {
            Some(path) => Some(RecordStore::open(path)?),
            None => None,
        };

        let delegate_listener = match config.delegate_listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let delegate_addr = match &delegate_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };
        #[cfg(unix)]
        let socket_listener = match &config.delegate_socket {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Some(tokio::net::UnixListener::bind(path)?)
            }
            None => None,
        };

        let state = NodeState::new(keys, config, dht, store);
        let restored = state.records.restore()?;

        let mut tasks = vec![tokio::spawn(service::serve_peers(p2p_listener, state.clone()))];
        if let Some(listener) = delegate_listener {
            tasks.push(tokio::spawn(service::serve_delegate(listener, state.clone())));
        }
        #[cfg(unix)]
        if let Some(listener) = socket_listener {
            tasks.push(tokio::spawn(service::serve_delegate_socket(listener, state.clone())));
        }

        let mut node = Self {
            state,
            p2p_addr,
            delegate_addr,
            public_addr,
            tasks,
        };

        if let Err(e) = node.state.dht.bootstrap().await {
            node.state.shutdown.cancel();
            return Err(e.into());
        }
        for address in node.state.records.addresses() {
            node.state.dht.announce(&address).await;
        }

        node.tasks.push(tokio::spawn(maintain(node.state.clone())));

        info!(
            peer_id = %node.peer_id(),
            addr = %node.multiaddr(),
            delegate = ?node.delegate_addr,
            restored,
            "Peer node started"
        );
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.state.keys.peer_id()
    }

    /// Hex public key; delegate clients sign this into their records
    pub fn public_key(&self) -> &str {
        self.state.public_key()
    }

    /// Dialable address including `/p2p/<peer-id>`, usable as a bootstrap peer
    pub fn multiaddr(&self) -> Multiaddr {
        self.public_addr.clone().with(Protocol::P2p(self.peer_id()))
    }

    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    pub fn delegate_addr(&self) -> Option<SocketAddr> {
        self.delegate_addr
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn peer_count(&self) -> usize {
        self.state.dht.peer_count()
    }

    /// Addresses with a live session
    pub fn connected_addresses(&self) -> Vec<String> {
        self.state.sessions.addresses()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state.sessions.contains(address)
    }

    /// Serve a delegate client over an already-open stream
    pub fn accept_client(&self, stream: BoxedStream) {
        tokio::spawn(service::handle_client(stream, self.state.clone(), ServiceKind::Delegate, None));
    }

    /// Close the session for an address and forget its record
    pub fn deregister(&self, address: &str) -> Result<bool, NodeError> {
        let session = self.state.sessions.evict(address);
        let record = self.state.records.remove(address)?;
        self.state.invalidate(address);
        let removed = session.is_some() || record.is_some();
        if removed {
            info!(address, "Agent deregistered");
        }
        Ok(removed)
    }

    /// Find the record for an address, locally or through the DHT
    pub async fn resolve(&self, address: &str) -> Result<AgentRecord, NodeError> {
        router::resolve(&self.state, address)
            .await
            .ok_or_else(|| NodeError::UnknownAddress(address.to_string()))
    }

    /// Route an envelope as if a local session had sent it
    pub async fn route(&self, envelope: Envelope) -> Status {
        router::route(&self.state, envelope).await
    }

    /// Stop listeners, close sessions and wait for the node's tasks
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        self.state.sessions.close_all();
        for task in self.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Node task failed");
                }
            }
        }
        #[cfg(unix)]
        if let Some(path) = &self.state.config.delegate_socket {
            let _ = std::fs::remove_file(path);
        }
        info!(peer_id = %self.state.keys.peer_id(), "Peer node stopped");
    }
}

/// Periodic republish of hosted addresses and expiry of stale DHT state
async fn maintain(state: Arc<NodeState>) {
    let mut interval = tokio::time::interval(state.config.republish_interval());
    interval.tick().await;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                state.dht.expire();
                for address in state.records.addresses() {
                    state.dht.announce(&address).await;
                }
                debug!(
                    peers = state.dht.peer_count(),
                    records = state.records.len(),
                    sessions = state.sessions.len(),
                    "Republished agent addresses"
                );
            }
        }
    }
}
