// network/discovery.rs - DHT Peer Discovery

//! Kademlia-style discovery over `/acn-kad/0.1.0` peer streams.
//!
//! Each RPC is one request frame and one response frame on a fresh stream.
//! Both frames carry the sender's [`proto::PeerInfo`], so every exchange
//! teaches each side about the other. Agent addresses are located through
//! provider records: the node hosting an agent announces itself to the peers
//! closest to `sha256(address)`, and lookups walk towards that key.

use bytes::Bytes;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::routing::{
    DEFAULT_BUCKET_SIZE, DhtKey, Distance, InsertOutcome, PeerInfoError, RoutingTable,
    RoutingTableEntry,
};
use super::transport::{BoxedStream, PROTOCOL_DHT, TransportError, open_stream, split_peer_id};
use crate::proto::{self, dht_request::Kind};
use crate::wire::RawFrameCodec;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Bucket capacity and lookup width (Kademlia `k`)
    pub bucket_size: usize,

    /// Parallel queries per lookup round
    pub alpha: usize,

    /// Maximum lookup rounds before giving up
    pub max_hops: usize,

    /// Timeout for one RPC, connect included
    pub rpc_timeout: Duration,

    /// How long provider records are kept without re-announcement
    pub provider_ttl: Duration,

    /// Contacts not seen for this long are dropped
    pub peer_ttl: Duration,

    /// Bootstrap peers, each ending in `/p2p/<peer-id>`
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: 3,
            max_hops: 20,
            rpc_timeout: Duration::from_secs(5),
            provider_ttl: Duration::from_secs(3600),
            peer_ttl: Duration::from_secs(3600),
            bootstrap_peers: vec![],
        }
    }
}

impl DiscoveryConfig {
    pub fn with_bootstrap_peer(mut self, addr: Multiaddr) -> Self {
        self.bootstrap_peers.push(addr);
        self
    }

    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }
}

/// Errors raised by discovery operations
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid peer info: {0}")]
    PeerInfo(#[from] PeerInfoError),

    #[error("Bootstrap address {0} lacks a /p2p peer id")]
    InvalidBootstrap(String),

    #[error("No bootstrap peer answered ({0} tried)")]
    BootstrapFailed(usize),

    #[error("Peer {0} has no reachable address")]
    Unreachable(PeerId),

    #[error("Peer answered as {found}, expected {expected}")]
    PeerMismatch { expected: PeerId, found: PeerId },
}

/// A peer claiming to host an agent address
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub provider: RoutingTableEntry,
    pub expires_at: Instant,
}

/// Provider records keyed by agent address
#[derive(Debug, Default)]
pub struct ProviderStore {
    records: HashMap<String, Vec<ProviderRecord>>,
}

impl ProviderStore {
    pub fn add(&mut self, address: &str, provider: RoutingTableEntry, ttl: Duration) {
        let list = self.records.entry(address.to_string()).or_default();
        list.retain(|r| r.provider.peer_id != provider.peer_id);
        list.push(ProviderRecord {
            provider,
            expires_at: Instant::now() + ttl,
        });
    }

    pub fn get(&self, address: &str) -> Vec<RoutingTableEntry> {
        let now = Instant::now();
        self.records
            .get(address)
            .map(|list| {
                list.iter()
                    .filter(|r| r.expires_at > now)
                    .map(|r| r.provider.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&mut self, address: &str, peer_id: &PeerId) {
        if let Some(list) = self.records.get_mut(address) {
            list.retain(|r| &r.provider.peer_id != peer_id);
            if list.is_empty() {
                self.records.remove(address);
            }
        }
    }

    /// Drop expired records, returning how many were removed
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.records.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.expires_at > now);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of an iterative lookup
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    /// Closest responsive peers found, nearest first
    pub closest: Vec<RoutingTableEntry>,

    /// Providers found for an address lookup
    pub providers: Vec<RoutingTableEntry>,

    /// Rounds of queries performed
    pub hops: usize,
}

#[derive(Debug, Clone)]
enum Query {
    FindNode(Vec<u8>),
    GetProviders(String),
}

impl Query {
    fn target(&self) -> DhtKey {
        match self {
            Query::FindNode(key) => DhtKey::from_preimage(key),
            Query::GetProviders(address) => DhtKey::for_address(address),
        }
    }

    fn to_kind(&self) -> Kind {
        match self {
            Query::FindNode(key) => Kind::FindNode(proto::FindNode { key: key.clone() }),
            Query::GetProviders(address) => Kind::GetProviders(proto::GetProviders {
                agent_address: address.clone(),
            }),
        }
    }
}

type DhtFramed = Framed<BoxedStream, RawFrameCodec>;

/// Routing table, provider records and the RPC client/server around them
pub struct Dht {
    local: RoutingTableEntry,
    config: DiscoveryConfig,
    table: RwLock<RoutingTable>,
    providers: RwLock<ProviderStore>,
}

impl Dht {
    /// `local` describes this node as advertised to others
    pub fn new(local: RoutingTableEntry, config: DiscoveryConfig) -> Self {
        let table = RoutingTable::new(local.peer_id, config.bucket_size);
        Self {
            local,
            config,
            table: RwLock::new(table),
            providers: RwLock::new(ProviderStore::default()),
        }
    }

    pub fn local(&self) -> &RoutingTableEntry {
        &self.local
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.table.read().len()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<RoutingTableEntry> {
        self.table.read().get(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<RoutingTableEntry> {
        self.table.read().entries().cloned().collect()
    }

    pub fn closest_peers(&self, key: &DhtKey, count: usize) -> Vec<RoutingTableEntry> {
        self.table.read().closest(key, count)
    }

    /// Providers known locally for an address
    pub fn local_providers(&self, address: &str) -> Vec<RoutingTableEntry> {
        self.providers.read().get(address)
    }

    pub fn forget_provider(&self, address: &str, peer_id: &PeerId) {
        self.providers.write().remove(address, peer_id);
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<RoutingTableEntry> {
        self.table.write().remove(peer_id)
    }

    /// Add or refresh a contact. A full bucket keeps its oldest contact
    /// unless that contact fails a ping.
    pub async fn observe(&self, entry: RoutingTableEntry) {
        let outcome = self.table.write().insert(entry.clone());
        match outcome {
            InsertOutcome::Inserted => {
                debug!(peer = %entry.peer_id, "Discovered new peer");
            }
            InsertOutcome::BucketFull { oldest } => {
                if !self.ping(&oldest).await {
                    debug!(evicted = %oldest.peer_id, peer = %entry.peer_id, "Replacing unresponsive peer");
                    let mut table = self.table.write();
                    table.remove(&oldest.peer_id);
                    table.insert(entry);
                } else {
                    self.table.write().touch(&oldest.peer_id);
                }
            }
            InsertOutcome::Updated | InsertOutcome::Ignored => {}
        }
    }

    /// Contact every bootstrap peer, then look up our own key to fill the table
    pub async fn bootstrap(&self) -> Result<usize, DiscoveryError> {
        if self.config.bootstrap_peers.is_empty() {
            return Ok(0);
        }

        let mut answered = 0;
        for addr in &self.config.bootstrap_peers {
            let (dial, peer_id) = split_peer_id(addr);
            let Some(peer_id) = peer_id else {
                return Err(DiscoveryError::InvalidBootstrap(addr.to_string()));
            };
            let request = Kind::FindNode(proto::FindNode {
                key: self.local.peer_id.to_bytes(),
            });
            match self.rpc_addr(&dial, Some(peer_id), request).await {
                Ok(_) => {
                    answered += 1;
                    info!(peer = %peer_id, addr = %dial, "Bootstrap peer answered");
                }
                Err(e) => warn!(peer = %peer_id, addr = %dial, error = %e, "Bootstrap peer failed"),
            }
        }
        if answered == 0 {
            return Err(DiscoveryError::BootstrapFailed(self.config.bootstrap_peers.len()));
        }

        let outcome = self
            .lookup(Query::FindNode(self.local.peer_id.to_bytes()))
            .await;
        info!(
            peers = self.peer_count(),
            hops = outcome.hops,
            "Bootstrap complete"
        );
        Ok(answered)
    }

    /// Iteratively find the peers closest to a key preimage
    pub async fn find_closest(&self, preimage: &[u8]) -> LookupOutcome {
        self.lookup(Query::FindNode(preimage.to_vec())).await
    }

    /// Find peers providing an agent address, local records first
    pub async fn find_providers(&self, address: &str) -> LookupOutcome {
        let local: Vec<_> = self
            .local_providers(address)
            .into_iter()
            .filter(|p| p.peer_id != self.local.peer_id)
            .collect();
        if !local.is_empty() {
            return LookupOutcome {
                providers: local,
                ..Default::default()
            };
        }
        self.lookup(Query::GetProviders(address.to_string())).await
    }

    /// Record this node as provider of `address` locally and on the closest peers
    pub async fn announce(&self, address: &str) -> usize {
        self.providers
            .write()
            .add(address, self.local.clone(), self.config.provider_ttl);

        let outcome = self.find_closest(address.as_bytes()).await;
        let request = Kind::AddProvider(proto::AddProvider {
            agent_address: address.to_string(),
        });
        let results = join_all(
            outcome
                .closest
                .iter()
                .map(|peer| self.rpc(peer, request.clone())),
        )
        .await;
        let stored = results.iter().filter(|r| r.is_ok()).count();
        debug!(address, stored, hops = outcome.hops, "Announced address");
        stored
    }

    /// Drop expired provider records and stale contacts
    pub fn expire(&self) {
        let providers = self.providers.write().expire();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.peer_ttl).unwrap_or(chrono::Duration::hours(1));
        let peers = self.table.write().remove_stale(cutoff);
        if providers > 0 || !peers.is_empty() {
            debug!(providers, peers = peers.len(), "Expired DHT state");
        }
    }

    async fn lookup(&self, query: Query) -> LookupOutcome {
        let target = query.target();
        let k = self.config.bucket_size;

        let mut shortlist: BTreeMap<Distance, RoutingTableEntry> = self
            .closest_peers(&target, k)
            .into_iter()
            .map(|e| (e.key().distance(&target), e))
            .collect();
        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut providers: Vec<RoutingTableEntry> = Vec::new();
        let mut hops = 0;

        while hops < self.config.max_hops {
            let batch: Vec<RoutingTableEntry> = shortlist
                .values()
                .take(k)
                .filter(|e| !queried.contains(&e.peer_id))
                .take(self.config.alpha.max(1))
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            hops += 1;

            let responses =
                join_all(batch.iter().map(|peer| self.rpc(peer, query.to_kind()))).await;

            for (peer, response) in batch.iter().zip(responses) {
                queried.insert(peer.peer_id);
                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(peer = %peer.peer_id, error = %e, "Lookup query failed");
                        shortlist.remove(&peer.key().distance(&target));
                        continue;
                    }
                };
                for info in response.closer_peers {
                    let Ok(entry) = RoutingTableEntry::try_from(info) else {
                        continue;
                    };
                    if entry.peer_id == self.local.peer_id {
                        continue;
                    }
                    self.observe(entry.clone()).await;
                    shortlist
                        .entry(entry.key().distance(&target))
                        .or_insert(entry);
                }
                for info in response.providers {
                    if let Ok(entry) = RoutingTableEntry::try_from(info) {
                        if entry.peer_id != self.local.peer_id
                            && !providers.iter().any(|p| p.peer_id == entry.peer_id)
                        {
                            providers.push(entry);
                        }
                    }
                }
            }

            if !providers.is_empty() {
                break;
            }
            while shortlist.len() > k {
                shortlist.pop_last();
            }
        }

        let closest = shortlist
            .into_values()
            .filter(|e| queried.contains(&e.peer_id))
            .take(k)
            .collect();
        LookupOutcome {
            closest,
            providers,
            hops,
        }
    }

    fn request(&self, kind: Kind) -> proto::DhtRequest {
        proto::DhtRequest {
            sender: Some(self.local.to_peer_info()),
            kind: Some(kind),
        }
    }

    /// Send one request to a known peer, trying each of its addresses
    async fn rpc(&self, peer: &RoutingTableEntry, kind: Kind) -> Result<proto::DhtResponse, DiscoveryError> {
        let mut last_error = DiscoveryError::Unreachable(peer.peer_id);
        for addr in peer.known_addresses.iter().rev() {
            match self.rpc_addr(addr, Some(peer.peer_id), kind.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    async fn rpc_addr(
        &self,
        addr: &Multiaddr,
        expected: Option<PeerId>,
        kind: Kind,
    ) -> Result<proto::DhtResponse, DiscoveryError> {
        let (response, responder) = self.exchange(addr, expected, kind).await?;
        if let Some(responder) = responder {
            self.observe(responder).await;
        }
        Ok(response)
    }

    /// Liveness probe that does not touch the routing table
    async fn ping(&self, peer: &RoutingTableEntry) -> bool {
        for addr in peer.known_addresses.iter().rev() {
            let ping = Kind::Ping(proto::Ping {});
            if self.exchange(addr, Some(peer.peer_id), ping).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn exchange(
        &self,
        addr: &Multiaddr,
        expected: Option<PeerId>,
        kind: Kind,
    ) -> Result<(proto::DhtResponse, Option<RoutingTableEntry>), DiscoveryError> {
        let exchange = async {
            let stream = open_stream(addr, PROTOCOL_DHT, self.config.rpc_timeout).await?;
            let mut framed: DhtFramed = Framed::new(stream, RawFrameCodec::new());
            framed
                .send(Bytes::from(self.request(kind).encode_to_vec()))
                .await
                .map_err(TransportError::from)?;
            let frame = framed
                .next()
                .await
                .ok_or(TransportError::Closed)?
                .map_err(TransportError::from)?;
            Ok::<_, DiscoveryError>(proto::DhtResponse::decode(frame.freeze())?)
        };
        let response = tokio::time::timeout(self.config.rpc_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(format!("DHT rpc to {}", addr)))??;

        let Some(info) = response.sender.clone() else {
            return Ok((response, None));
        };
        let mut responder = RoutingTableEntry::try_from(info)?;
        if let Some(expected) = expected {
            if responder.peer_id != expected {
                return Err(DiscoveryError::PeerMismatch {
                    expected,
                    found: responder.peer_id,
                });
            }
        }
        if !responder.known_addresses.contains(addr) {
            responder.known_addresses.push(addr.clone());
        }
        Ok((response, Some(responder)))
    }

    /// Answer one request. The sender is learned before answering.
    pub async fn handle_request(&self, request: proto::DhtRequest) -> proto::DhtResponse {
        let sender = request
            .sender
            .and_then(|info| RoutingTableEntry::try_from(info).ok());
        if let Some(sender) = &sender {
            self.observe(sender.clone()).await;
        }
        let requester = sender.as_ref().map(|s| s.peer_id);
        let k = self.config.bucket_size;
        let closest = |key: DhtKey| -> Vec<proto::PeerInfo> {
            self.closest_peers(&key, k)
                .into_iter()
                .filter(|e| Some(e.peer_id) != requester)
                .map(|e| e.to_peer_info())
                .collect()
        };

        let mut response = proto::DhtResponse {
            sender: Some(self.local.to_peer_info()),
            ..Default::default()
        };
        match request.kind {
            Some(Kind::FindNode(find)) => {
                response.closer_peers = closest(DhtKey::from_preimage(&find.key));
            }
            Some(Kind::GetProviders(get)) => {
                response.providers = self
                    .local_providers(&get.agent_address)
                    .iter()
                    .map(|p| p.to_peer_info())
                    .collect();
                response.closer_peers = closest(DhtKey::for_address(&get.agent_address));
            }
            Some(Kind::AddProvider(add)) => match sender {
                Some(provider) => {
                    debug!(address = %add.agent_address, provider = %provider.peer_id, "Stored provider record");
                    self.providers
                        .write()
                        .add(&add.agent_address, provider, self.config.provider_ttl);
                }
                None => warn!(address = %add.agent_address, "AddProvider without a valid sender"),
            },
            Some(Kind::Ping(_)) | None => {}
        }
        response
    }

    /// Serve one DHT stream: a single request and its response
    pub async fn serve_stream(&self, stream: BoxedStream) -> Result<(), DiscoveryError> {
        let mut framed: DhtFramed = Framed::new(stream, RawFrameCodec::new());
        let frame = tokio::time::timeout(self.config.rpc_timeout, framed.next())
            .await
            .map_err(|_| TransportError::Timeout("DHT request".into()))?
            .ok_or(TransportError::Closed)?
            .map_err(TransportError::from)?;
        let request = proto::DhtRequest::decode(frame.freeze())?;
        let response = self.handle_request(request).await;
        framed
            .send(Bytes::from(response.encode_to_vec()))
            .await
            .map_err(TransportError::from)?;
        Ok(())
    }
}
