// node/state.rs - Shared Node State

//! State shared by every connection handler of a peer node: the DHT, the
//! live sessions, the known agent records and the resolution cache. Handlers
//! only see these through the accessors below.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{DuplicatePolicy, NodeConfig};
use crate::network::{Dht, RoutingTableEntry};
use crate::trust::{PeerKeypair, RecordStore, StoreError};
use crate::wire::{AgentRecord, Envelope};

/// Front end a session arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ServiceKind {
    #[display("delegate")]
    Delegate,
    #[display("relay")]
    Relay,
}

/// Registry view of one serving session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub address: String,
    pub kind: ServiceKind,
    outbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
}

/// Why a queued delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The session is gone
    Closed,
    /// The session's outbound queue is full
    Full,
}

impl SessionHandle {
    pub fn new(
        address: impl Into<String>,
        kind: ServiceKind,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: Uuid::new_v4(),
            address: address.into(),
            kind,
            outbound,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Queue an envelope for the client without waiting
    pub fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the session task to close its connection
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }
}

/// Outcome of inserting a session under a duplicate policy
#[derive(Debug)]
pub enum SessionInsert {
    Inserted,
    /// The previous session for the address was closed
    Replaced(SessionHandle),
    /// Refused; the address already has a session
    Rejected,
}

/// At most one live session per agent address
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    policy: DuplicatePolicy,
}

impl SessionRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    pub fn insert(&self, handle: SessionHandle) -> SessionInsert {
        let mut sessions = self.sessions.write();
        match sessions.get(&handle.address) {
            Some(existing) if existing.is_open() && self.policy == DuplicatePolicy::Reject => {
                SessionInsert::Rejected
            }
            _ => match sessions.insert(handle.address.clone(), handle) {
                Some(previous) => {
                    previous.close();
                    SessionInsert::Replaced(previous)
                }
                None => SessionInsert::Inserted,
            },
        }
    }

    /// Remove the session only if it is still the one identified by `id`
    pub fn remove(&self, address: &str, id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(address) {
            Some(current) if current.id == id => {
                sessions.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Remove and close whatever session holds the address
    pub fn evict(&self, address: &str) -> Option<SessionHandle> {
        let removed = self.sessions.write().remove(address);
        if let Some(handle) = &removed {
            handle.close();
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<SessionHandle> {
        self.sessions.read().get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.sessions.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn count(&self, kind: ServiceKind) -> usize {
        self.sessions.read().values().filter(|s| s.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session
    pub fn close_all(&self) {
        for (_, handle) in self.sessions.write().drain() {
            handle.close();
        }
    }
}

/// Agent records this node represents, optionally mirrored to disk
pub struct RecordBook {
    records: RwLock<HashMap<String, AgentRecord>>,
    store: Option<RecordStore>,
}

impl RecordBook {
    pub fn new(store: Option<RecordStore>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load persisted records, returning how many were restored
    pub fn restore(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all()?;
        let count = loaded.len();
        let mut records = self.records.write();
        for record in loaded {
            records.insert(record.address.clone(), record);
        }
        Ok(count)
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    pub fn put(&self, record: AgentRecord) -> Result<(), StoreError> {
        if let Some(store) = &self.store {
            store.put(&record)?;
        }
        self.records.write().insert(record.address.clone(), record);
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<AgentRecord> {
        self.records.read().get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.records.read().contains_key(address)
    }

    pub fn remove(&self, address: &str) -> Result<Option<AgentRecord>, StoreError> {
        if let Some(store) = &self.store {
            store.remove(address)?;
        }
        Ok(self.records.write().remove(address))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// A remote address resolved to the peer hosting it
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: AgentRecord,
    pub provider: RoutingTableEntry,
}

/// Everything connection handlers share
pub struct NodeState {
    pub keys: PeerKeypair,
    pub config: NodeConfig,
    pub dht: Dht,
    pub sessions: SessionRegistry,
    pub records: RecordBook,
    cache: DashMap<String, Resolution>,
    pub shutdown: CancellationToken,
}

impl NodeState {
    pub fn new(keys: PeerKeypair, config: NodeConfig, dht: Dht, store: Option<RecordStore>) -> Arc<Self> {
        let sessions = SessionRegistry::new(config.duplicate_policy);
        Arc::new(Self {
            keys,
            config,
            dht,
            sessions,
            records: RecordBook::new(store),
            cache: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn public_key(&self) -> &str {
        self.keys.public_key()
    }

    pub fn cached(&self, address: &str) -> Option<Resolution> {
        self.cache.get(address).map(|r| r.value().clone())
    }

    pub fn cache(&self, address: &str, resolution: Resolution) {
        self.cache.insert(address.to_string(), resolution);
    }

    pub fn invalidate(&self, address: &str) {
        if self.cache.remove(address).is_some() {
            debug!(address, "Dropped cached resolution");
        }
    }

    /// Record a verified registration and publish it to the DHT
    pub fn admit(self: &Arc<Self>, record: AgentRecord) -> Result<(), StoreError> {
        let address = record.address.clone();
        self.records.put(record)?;
        self.invalidate(&address);

        let state = self.clone();
        tokio::spawn(async move {
            let stored = state.dht.announce(&address).await;
            info!(address = %address, stored, "Published agent address");
        });
        Ok(())
    }

    /// Forget a record when its session ends, unless records are persisted
    pub fn release(&self, address: &str) {
        if self.records.is_persistent() || self.sessions.contains(address) {
            return;
        }
        if let Err(e) = self.records.remove(address) {
            warn!(address, error = %e, "Failed to drop agent record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str) -> AgentRecord {
        AgentRecord {
            address: address.into(),
            ledger_id: "fetchai".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_replace_policy_closes_previous() {
        let registry = SessionRegistry::new(DuplicatePolicy::Replace);
        let (first, _rx1) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 4);
        let (second, _rx2) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 4);
        let first_cancel = first.cancelled();

        assert!(matches!(registry.insert(first.clone()), SessionInsert::Inserted));
        assert!(matches!(registry.insert(second.clone()), SessionInsert::Replaced(_)));
        assert!(first_cancel.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("fetch1a").unwrap().id, second.id);

        // The replaced session's cleanup must not remove its successor
        assert!(!registry.remove("fetch1a", first.id));
        assert!(registry.contains("fetch1a"));
        assert!(registry.remove("fetch1a", second.id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reject_policy_keeps_first() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let (first, _rx1) = SessionHandle::new("fetch1a", ServiceKind::Relay, 4);
        let (second, _rx2) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 4);

        registry.insert(first.clone());
        assert!(matches!(registry.insert(second), SessionInsert::Rejected));
        assert_eq!(registry.get("fetch1a").unwrap().id, first.id);
        assert_eq!(registry.count(ServiceKind::Relay), 1);
        assert_eq!(registry.count(ServiceKind::Delegate), 0);
    }

    #[test]
    fn test_reject_policy_allows_after_close() {
        let registry = SessionRegistry::new(DuplicatePolicy::Reject);
        let (first, _rx1) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 4);
        let (second, _rx2) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 4);

        registry.insert(first.clone());
        first.close();
        assert!(matches!(registry.insert(second), SessionInsert::Replaced(_)));
    }

    #[test]
    fn test_delivery_to_full_and_closed_queue() {
        let (handle, rx) = SessionHandle::new("fetch1a", ServiceKind::Delegate, 1);
        assert!(handle.deliver(Envelope::new("fetch1a", "fetch1b", b"one".to_vec())).is_ok());
        assert_eq!(
            handle.deliver(Envelope::new("fetch1a", "fetch1b", b"two".to_vec())),
            Err(DeliveryError::Full)
        );
        drop(rx);
        assert_eq!(
            handle.deliver(Envelope::new("fetch1a", "fetch1b", b"three".to_vec())),
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn test_record_book_persists_through_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = RecordBook::new(Some(RecordStore::open(dir.path()).unwrap()));
            book.put(record("fetch1a")).unwrap();
            book.put(record("fetch1b")).unwrap();
            book.remove("fetch1b").unwrap();
        }
        let book = RecordBook::new(Some(RecordStore::open(dir.path()).unwrap()));
        assert_eq!(book.restore().unwrap(), 1);
        assert!(book.contains("fetch1a"));
        assert!(!book.contains("fetch1b"));
    }
}
