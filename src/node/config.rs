// node/config.rs - Peer Node Configuration

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::NodeError;
use crate::network::DiscoveryConfig;
use crate::network::transport::split_peer_id;
use crate::observability::{MetricsConfig, TracingConfig};

/// What happens when an address registers while already holding a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// The new session wins; the old one is closed
    #[default]
    #[display("replace")]
    Replace,
    /// The new registration is refused
    #[display("reject")]
    Reject,
}

/// Wait bounds, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub status_ms: u64,
    pub lookup_ms: u64,
    pub new_stream_ms: u64,
    pub registration_ms: u64,
    pub forward_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            status_ms: 5_000,
            lookup_ms: 20_000,
            new_stream_ms: 10_000,
            registration_ms: 10_000,
            forward_ms: 20_000,
        }
    }
}

impl TimeoutConfig {
    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }

    pub fn lookup(&self) -> Duration {
        Duration::from_millis(self.lookup_ms)
    }

    pub fn new_stream(&self) -> Duration {
        Duration::from_millis(self.new_stream_ms)
    }

    pub fn registration(&self) -> Duration {
        Duration::from_millis(self.registration_ms)
    }

    pub fn forward(&self) -> Duration {
        Duration::from_millis(self.forward_ms)
    }
}

/// DHT tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    pub bucket_size: usize,
    pub alpha: usize,
    pub max_hops: usize,
    pub rpc_timeout_ms: u64,
    pub republish_interval_secs: u64,
    pub provider_ttl_secs: u64,
    pub peer_ttl_secs: u64,
}

impl Default for DhtSettings {
    fn default() -> Self {
        let discovery = DiscoveryConfig::default();
        Self {
            bucket_size: discovery.bucket_size,
            alpha: discovery.alpha,
            max_hops: discovery.max_hops,
            rpc_timeout_ms: discovery.rpc_timeout.as_millis() as u64,
            republish_interval_secs: 600,
            provider_ttl_secs: discovery.provider_ttl.as_secs(),
            peer_ttl_secs: discovery.peer_ttl.as_secs(),
        }
    }
}

/// Peer node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hex secp256k1 secret of the node; a fresh key is generated when unset
    pub peer_key: Option<String>,

    /// Listen address for peer streams (DHT, forwarding, relay)
    pub p2p_listen: SocketAddr,

    /// Multiaddr advertised to other peers; defaults to the bound listen address
    pub public_address: Option<String>,

    /// Listen address for delegate clients; disabled when unset
    pub delegate_listen: Option<SocketAddr>,

    /// Unix socket path for co-located delegate clients
    pub delegate_socket: Option<PathBuf>,

    /// Accept relay registrations on the peer listener
    pub enable_relay: bool,

    /// Bootstrap peers as `/ip4/<host>/tcp/<port>/p2p/<peer-id>`
    pub bootstrap_peers: Vec<String>,

    /// Directory of the persistent record store; records live in memory only when unset
    pub record_store_path: Option<PathBuf>,

    pub duplicate_policy: DuplicatePolicy,

    /// Capacity of each session's outbound envelope queue
    pub session_queue: usize,

    pub timeouts: TimeoutConfig,

    pub dht: DhtSettings,

    pub log: TracingConfig,

    /// Prometheus endpoint; disabled when unset
    pub metrics: Option<MetricsConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_key: None,
            p2p_listen: SocketAddr::from(([0, 0, 0, 0], 9000)),
            public_address: None,
            delegate_listen: Some(SocketAddr::from(([0, 0, 0, 0], 11000))),
            delegate_socket: None,
            enable_relay: true,
            bootstrap_peers: vec![],
            record_store_path: None,
            duplicate_policy: DuplicatePolicy::default(),
            session_queue: 100,
            timeouts: TimeoutConfig::default(),
            dht: DhtSettings::default(),
            log: TracingConfig::default(),
            metrics: None,
        }
    }
}

impl NodeConfig {
    /// Loopback listeners on ephemeral ports
    pub fn local() -> Self {
        Self {
            p2p_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            delegate_listen: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            ..Default::default()
        }
    }

    /// Layer an optional file (TOML, JSON or YAML by extension) and
    /// `ACN_`-prefixed environment variables over the defaults.
    /// Nested keys use `__`, e.g. `ACN_DHT__MAX_HOPS=10`.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ACN")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("bootstrap_peers")
                .try_parsing(true),
        );
        let loaded: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| NodeError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn with_peer_key(mut self, secret_hex: impl Into<String>) -> Self {
        self.peer_key = Some(secret_hex.into());
        self
    }

    pub fn with_bootstrap_peer(mut self, addr: impl Into<String>) -> Self {
        self.bootstrap_peers.push(addr.into());
        self
    }

    pub fn with_delegate_listen(mut self, addr: Option<SocketAddr>) -> Self {
        self.delegate_listen = addr;
        self
    }

    pub fn with_record_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.record_store_path = Some(path.into());
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if let Some(public) = &self.public_address {
            public
                .parse::<Multiaddr>()
                .map_err(|e| NodeError::Config(format!("public_address {}: {}", public, e)))?;
        }
        for peer in &self.bootstrap_peers {
            self.parse_bootstrap(peer)?;
        }
        if self.dht.bucket_size == 0 || self.dht.alpha == 0 || self.dht.max_hops == 0 {
            return Err(NodeError::Config(
                "dht bucket_size, alpha and max_hops must be positive".into(),
            ));
        }
        if self.session_queue == 0 {
            return Err(NodeError::Config("session_queue must be positive".into()));
        }
        Ok(())
    }

    fn parse_bootstrap(&self, peer: &str) -> Result<Multiaddr, NodeError> {
        let addr: Multiaddr = peer
            .parse()
            .map_err(|e| NodeError::Config(format!("bootstrap peer {}: {}", peer, e)))?;
        if split_peer_id(&addr).1.is_none() {
            return Err(NodeError::Config(format!(
                "bootstrap peer {} lacks a /p2p peer id",
                peer
            )));
        }
        Ok(addr)
    }

    pub fn discovery(&self) -> Result<DiscoveryConfig, NodeError> {
        let bootstrap_peers = self
            .bootstrap_peers
            .iter()
            .map(|p| self.parse_bootstrap(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DiscoveryConfig {
            bucket_size: self.dht.bucket_size,
            alpha: self.dht.alpha,
            max_hops: self.dht.max_hops,
            rpc_timeout: Duration::from_millis(self.dht.rpc_timeout_ms),
            provider_ttl: Duration::from_secs(self.dht.provider_ttl_secs),
            peer_ttl: Duration::from_secs(self.dht.peer_ttl_secs),
            bootstrap_peers,
        })
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.dht.republish_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::PeerKeypair;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Replace);
        assert_eq!(config.timeouts.status(), Duration::from_secs(5));
        assert_eq!(config.timeouts.lookup(), Duration::from_secs(20));
    }

    #[test]
    fn test_bootstrap_requires_peer_id() {
        let config = NodeConfig::local().with_bootstrap_peer("/ip4/127.0.0.1/tcp/9000");
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        let peer = PeerKeypair::generate();
        let config = NodeConfig::local()
            .with_bootstrap_peer(format!("/ip4/127.0.0.1/tcp/9000/p2p/{}", peer.peer_id()));
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery().unwrap().bootstrap_peers.len(), 1);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
p2p_listen = "127.0.0.1:9100"
duplicate_policy = "reject"
enable_relay = false

[dht]
max_hops = 7

[timeouts]
status_ms = 1500
"#
        )
        .unwrap();

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.p2p_listen.port(), 9100);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Reject);
        assert!(!config.enable_relay);
        assert_eq!(config.dht.max_hops, 7);
        assert_eq!(config.dht.bucket_size, 20);
        assert_eq!(config.timeouts.status(), Duration::from_millis(1500));
        assert_eq!(config.timeouts.forward(), Duration::from_secs(20));
    }

    #[test]
    fn test_zero_hops_rejected() {
        let mut config = NodeConfig::local();
        config.dht.max_hops = 0;
        assert!(config.validate().is_err());
    }
}
