// trust/store.rs - Persistent Agent Record Store using Sled

use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

use crate::wire::AgentRecord;

/// Errors related to record store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

const TREE_RECORDS: &str = "agent_records";

/// On-disk `address -> AgentRecord` map used to survive node restarts
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
    records: Tree,
}

impl RecordStore {
    /// Open or create a record store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let records = db.open_tree(TREE_RECORDS)?;
        Ok(Self { db, records })
    }

    /// Create an in-memory record store (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let records = db.open_tree(TREE_RECORDS)?;
        Ok(Self { db, records })
    }

    /// Insert or replace the record for its address
    pub fn put(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.records.insert(record.address.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, address: &str) -> Result<Option<AgentRecord>, StoreError> {
        match self.records.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a record, returning whether one existed
    pub fn remove(&self, address: &str) -> Result<bool, StoreError> {
        let existed = self.records.remove(address.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(existed)
    }

    /// Load every stored record
    pub fn load_all(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let mut records = Vec::new();
        for result in self.records.iter() {
            let (_, bytes) = result?;
            records.push(decode_record(&bytes)?);
        }
        Ok(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn decode_record(bytes: &[u8]) -> Result<AgentRecord, StoreError> {
    let (record, _): (AgentRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(address: &str) -> AgentRecord {
        AgentRecord {
            address: address.into(),
            public_key: "02aa".into(),
            peer_public_key: "03bb".into(),
            signature: "sig".into(),
            ledger_id: "fetchai".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store = RecordStore::in_memory().unwrap();
        assert!(store.is_empty());

        store.put(&record("fetch1a")).unwrap();
        assert_eq!(store.get("fetch1a").unwrap(), Some(record("fetch1a")));
        assert_eq!(store.len(), 1);

        assert!(store.remove("fetch1a").unwrap());
        assert!(!store.remove("fetch1a").unwrap());
        assert!(store.get("fetch1a").unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_by_address() {
        let store = RecordStore::in_memory().unwrap();
        store.put(&record("fetch1a")).unwrap();
        let updated = record("fetch1a").with_service_id("svc");
        store.put(&updated).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("fetch1a").unwrap(), Some(updated));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records");
        {
            let store = RecordStore::open(&path).unwrap();
            store.put(&record("fetch1a")).unwrap();
            store.put(&record("fetch1b")).unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        let mut addresses: Vec<_> = store.load_all().unwrap().into_iter().map(|r| r.address).collect();
        addresses.sort();
        assert_eq!(addresses, vec!["fetch1a", "fetch1b"]);
    }
}
