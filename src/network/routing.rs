// network/routing.rs - Kademlia Routing Table

//! XOR-metric routing table.
//!
//! Peers and agent addresses share one 256-bit keyspace: a peer sits at
//! `sha256(peer_id)` and an agent address at `sha256(address)`. Bucket `i`
//! holds peers whose distance from the local key lies in `[2^i, 2^(i+1))`,
//! so a table of N participants keeps O(log N) well-spread contacts.

use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

use crate::proto;
use crate::trust::peer_id_from_public_key;

/// Keyspace width in bits
pub const KEY_BITS: usize = 256;

/// Default bucket capacity (Kademlia `k`)
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Errors converting advertised peer information
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerInfoError {
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Peer id does not belong to public key {0}")]
    KeyMismatch(String),

    #[error("Invalid address {0}")]
    InvalidAddress(String),
}

/// A position in the XOR keyspace
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhtKey([u8; 32]);

impl DhtKey {
    pub fn from_preimage(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn for_peer(peer_id: &PeerId) -> Self {
        Self::from_preimage(&peer_id.to_bytes())
    }

    pub fn for_address(address: &str) -> Self {
        Self::from_preimage(address.as_bytes())
    }

    pub fn distance(&self, other: &DhtKey) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// XOR distance, ordered as a big-endian 256-bit integer
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Index of the bucket this distance falls in; `None` for zero distance
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = i * 8 + byte.leading_zeros() as usize;
                return Some(KEY_BITS - 1 - bit);
            }
        }
        None
    }
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub peer_id: PeerId,

    /// Hex encoded compressed secp256k1 key
    pub public_key: String,

    /// Network locations, most recently learned last
    pub known_addresses: Vec<Multiaddr>,

    pub last_seen: DateTime<Utc>,
}

impl RoutingTableEntry {
    pub fn new(peer_id: PeerId, public_key: impl Into<String>, addresses: Vec<Multiaddr>) -> Self {
        Self {
            peer_id,
            public_key: public_key.into(),
            known_addresses: addresses,
            last_seen: Utc::now(),
        }
    }

    pub fn key(&self) -> DhtKey {
        DhtKey::for_peer(&self.peer_id)
    }

    pub fn to_peer_info(&self) -> proto::PeerInfo {
        proto::PeerInfo {
            peer_id: self.peer_id.to_bytes(),
            public_key: self.public_key.clone(),
            addrs: self.known_addresses.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl TryFrom<proto::PeerInfo> for RoutingTableEntry {
    type Error = PeerInfoError;

    /// Advertised ids must be the id of the advertised key
    fn try_from(info: proto::PeerInfo) -> Result<Self, Self::Error> {
        let peer_id = PeerId::from_bytes(&info.peer_id)
            .map_err(|e| PeerInfoError::InvalidPeerId(e.to_string()))?;
        match peer_id_from_public_key(&info.public_key) {
            Ok(derived) if derived == peer_id => {}
            _ => return Err(PeerInfoError::KeyMismatch(info.public_key)),
        }
        let known_addresses = info
            .addrs
            .iter()
            .map(|a| a.parse().map_err(|_| PeerInfoError::InvalidAddress(a.clone())))
            .collect::<Result<Vec<Multiaddr>, _>>()?;
        Ok(Self::new(peer_id, info.public_key, known_addresses))
    }
}

/// Result of offering an entry to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    /// The bucket is full; `oldest` is the least recently seen contact
    BucketFull { oldest: Box<RoutingTableEntry> },
    /// The local peer is never stored
    Ignored,
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    // Least recently seen first
    entries: Vec<RoutingTableEntry>,
}

/// Distance-partitioned table of known peers
#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    local_key: DhtKey,
    bucket_size: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, bucket_size: usize) -> Self {
        Self {
            local_id,
            local_key: DhtKey::for_peer(&local_id),
            bucket_size: bucket_size.max(1),
            buckets: vec![Bucket::default(); KEY_BITS],
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn local_key(&self) -> &DhtKey {
        &self.local_key
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn bucket_for(&self, peer_id: &PeerId) -> Option<usize> {
        self.local_key
            .distance(&DhtKey::for_peer(peer_id))
            .bucket_index()
    }

    /// Insert a new contact or refresh an existing one
    pub fn insert(&mut self, entry: RoutingTableEntry) -> InsertOutcome {
        if entry.peer_id == self.local_id {
            return InsertOutcome::Ignored;
        }
        let Some(index) = self.bucket_for(&entry.peer_id) else {
            return InsertOutcome::Ignored;
        };
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.entries.iter().position(|e| e.peer_id == entry.peer_id) {
            let mut existing = bucket.entries.remove(pos);
            for addr in entry.known_addresses {
                if !existing.known_addresses.contains(&addr) {
                    existing.known_addresses.push(addr);
                }
            }
            existing.public_key = entry.public_key;
            existing.last_seen = entry.last_seen.max(existing.last_seen);
            bucket.entries.push(existing);
            return InsertOutcome::Updated;
        }

        if bucket.entries.len() < bucket_size {
            bucket.entries.push(entry);
            InsertOutcome::Inserted
        } else {
            InsertOutcome::BucketFull {
                oldest: Box::new(bucket.entries[0].clone()),
            }
        }
    }

    /// Mark a contact as alive, moving it to the tail of its bucket
    pub fn touch(&mut self, peer_id: &PeerId) -> bool {
        let Some(index) = self.bucket_for(peer_id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.entries.iter().position(|e| &e.peer_id == peer_id) {
            Some(pos) => {
                let mut entry = bucket.entries.remove(pos);
                entry.last_seen = Utc::now();
                bucket.entries.push(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<RoutingTableEntry> {
        let index = self.bucket_for(peer_id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.entries.iter().position(|e| &e.peer_id == peer_id)?;
        Some(bucket.entries.remove(pos))
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&RoutingTableEntry> {
        let index = self.bucket_for(peer_id)?;
        self.buckets[index]
            .entries
            .iter()
            .find(|e| &e.peer_id == peer_id)
    }

    /// Up to `count` known peers ordered by distance to `target`
    pub fn closest(&self, target: &DhtKey, count: usize) -> Vec<RoutingTableEntry> {
        let mut all: Vec<_> = self
            .entries()
            .map(|e| (e.key().distance(target), e))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().take(count).map(|(_, e)| e.clone()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RoutingTableEntry> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop contacts not seen since `cutoff`
    pub fn remove_stale(&mut self, cutoff: DateTime<Utc>) -> Vec<PeerId> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            bucket.entries.retain(|e| {
                let keep = e.last_seen >= cutoff;
                if !keep {
                    removed.push(e.peer_id);
                }
                keep
            });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::PeerKeypair;

    fn entry() -> RoutingTableEntry {
        let keys = PeerKeypair::generate();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9000".parse().unwrap();
        RoutingTableEntry::new(keys.peer_id(), keys.public_key(), vec![addr])
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(Distance([0u8; 32]).bucket_index(), None);

        let mut d = [0u8; 32];
        d[31] = 1;
        assert_eq!(Distance(d).bucket_index(), Some(0));

        let mut d = [0u8; 32];
        d[0] = 0x80;
        assert_eq!(Distance(d).bucket_index(), Some(255));

        let mut d = [0u8; 32];
        d[30] = 0x01;
        assert_eq!(Distance(d).bucket_index(), Some(8));
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_to_self() {
        let a = DhtKey::for_address("fetch1a");
        let b = DhtKey::for_address("fetch1b");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a).bucket_index(), None);
    }

    #[test]
    fn test_insert_update_and_ignore_self() {
        let local = PeerKeypair::generate();
        let mut table = RoutingTable::new(local.peer_id(), DEFAULT_BUCKET_SIZE);

        let own = RoutingTableEntry::new(local.peer_id(), local.public_key(), vec![]);
        assert_eq!(table.insert(own), InsertOutcome::Ignored);

        let peer = entry();
        assert_eq!(table.insert(peer.clone()), InsertOutcome::Inserted);

        let mut again = peer.clone();
        again.known_addresses = vec!["/ip4/10.0.0.2/tcp/9000".parse().unwrap()];
        assert_eq!(table.insert(again), InsertOutcome::Updated);

        let stored = table.get(&peer.peer_id).unwrap();
        assert_eq!(stored.known_addresses.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_bucket_reports_oldest() {
        let local = PeerKeypair::generate();
        let mut table = RoutingTable::new(local.peer_id(), 1);

        // Fill until two peers collide in one bucket
        let mut seen: std::collections::HashMap<usize, RoutingTableEntry> = Default::default();
        loop {
            let e = entry();
            let index = table.bucket_for(&e.peer_id).unwrap();
            match seen.get(&index) {
                Some(first) => {
                    let outcome = table.insert(e);
                    assert_eq!(
                        outcome,
                        InsertOutcome::BucketFull {
                            oldest: Box::new(table.get(&first.peer_id).unwrap().clone())
                        }
                    );
                    break;
                }
                None => {
                    assert_eq!(table.insert(e.clone()), InsertOutcome::Inserted);
                    seen.insert(index, e);
                }
            }
        }
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let local = PeerKeypair::generate();
        let mut table = RoutingTable::new(local.peer_id(), DEFAULT_BUCKET_SIZE);
        for _ in 0..30 {
            table.insert(entry());
        }
        let target = DhtKey::for_address("fetch1target");
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(pair[0].key().distance(&target) <= pair[1].key().distance(&target));
        }
        let best = table
            .entries()
            .map(|e| e.key().distance(&target))
            .min()
            .unwrap();
        assert_eq!(closest[0].key().distance(&target), best);
    }

    #[test]
    fn test_remove_and_stale() {
        let local = PeerKeypair::generate();
        let mut table = RoutingTable::new(local.peer_id(), DEFAULT_BUCKET_SIZE);
        let old = {
            let mut e = entry();
            e.last_seen = Utc::now() - chrono::Duration::hours(2);
            e
        };
        let fresh = entry();
        table.insert(old.clone());
        table.insert(fresh.clone());

        let removed = table.remove_stale(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(removed, vec![old.peer_id]);
        assert!(table.remove(&fresh.peer_id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_peer_info_conversion() {
        let e = entry();
        let back = RoutingTableEntry::try_from(e.to_peer_info()).unwrap();
        assert_eq!(back.peer_id, e.peer_id);
        assert_eq!(back.known_addresses, e.known_addresses);

        let mut spoofed = e.to_peer_info();
        spoofed.public_key = PeerKeypair::generate().public_key().to_string();
        assert!(matches!(
            RoutingTableEntry::try_from(spoofed),
            Err(PeerInfoError::KeyMismatch(_))
        ));
    }
}
