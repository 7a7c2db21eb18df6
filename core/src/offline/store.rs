// Durable offline record store
//
// Keys are `offline:<recipient>:<ts, zero padded>:<uuid>` so a prefix scan
// returns one recipient's records in timestamp order. Every write is flushed.

use super::{OfflineError, OfflineRecord};
use crate::store::{StorageBackend, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const OFFLINE_PREFIX: &str = "offline:";

/// bincode layout of a record; bincode cannot skip optional fields
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    recipient: String,
    sender: String,
    payload: String,
    ts: u64,
    sig: Option<String>,
}

impl From<&OfflineRecord> for StoredRecord {
    fn from(r: &OfflineRecord) -> Self {
        Self {
            recipient: r.recipient.clone(),
            sender: r.sender.clone(),
            payload: r.payload.clone(),
            ts: r.ts,
            sig: r.sig.clone(),
        }
    }
}

impl From<StoredRecord> for OfflineRecord {
    fn from(r: StoredRecord) -> Self {
        Self {
            recipient: r.recipient,
            sender: r.sender,
            payload: r.payload,
            ts: r.ts,
            sig: r.sig,
        }
    }
}

/// Storage key of one held record, for removing exactly what was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey(Vec<u8>);

pub struct OfflineStore {
    db: Arc<dyn StorageBackend>,
}

impl OfflineStore {
    pub fn new(db: Arc<dyn StorageBackend>) -> Self {
        Self { db }
    }

    pub fn store(&self, record: &OfflineRecord) -> Result<(), OfflineError> {
        let key = format!(
            "{}{}:{:020}:{}",
            OFFLINE_PREFIX,
            record.recipient,
            record.ts,
            uuid::Uuid::new_v4()
        );
        let bytes = bincode::serialize(&StoredRecord::from(record))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.db.put(key.as_bytes(), &bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Records for `recipient` with `ts >= ts_since`, oldest first
    pub fn retrieve(&self, recipient: &str, ts_since: u64) -> Result<Vec<OfflineRecord>, OfflineError> {
        Ok(self
            .scan(recipient, ts_since)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Like [`retrieve`](Self::retrieve), with the key of each record
    pub fn retrieve_keyed(
        &self,
        recipient: &str,
        ts_since: u64,
    ) -> Result<Vec<(RecordKey, OfflineRecord)>, OfflineError> {
        Ok(self
            .scan(recipient, ts_since)?
            .into_iter()
            .map(|(key, record)| (RecordKey(key), record))
            .collect())
    }

    /// Remove the given records; anything stored since is left alone
    pub fn remove(&self, keys: &[RecordKey]) -> Result<(), OfflineError> {
        for key in keys {
            self.db.remove(&key.0)?;
        }
        if !keys.is_empty() {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Like [`retrieve`](Self::retrieve) but removes what it returns
    pub fn take(&self, recipient: &str, ts_since: u64) -> Result<Vec<OfflineRecord>, OfflineError> {
        let (keys, records): (Vec<_>, Vec<_>) =
            self.retrieve_keyed(recipient, ts_since)?.into_iter().unzip();
        self.remove(&keys)?;
        Ok(records)
    }

    /// Remove every record held for `recipient`
    pub fn purge(&self, recipient: &str) -> Result<usize, OfflineError> {
        Ok(self.take(recipient, 0)?.len())
    }

    pub fn count(&self, recipient: &str) -> Result<usize, OfflineError> {
        Ok(self.db.count_prefix(&prefix(recipient))?)
    }

    fn scan(
        &self,
        recipient: &str,
        ts_since: u64,
    ) -> Result<Vec<(Vec<u8>, OfflineRecord)>, OfflineError> {
        let mut out = Vec::new();
        for (key, value) in self.db.scan_prefix(&prefix(recipient))? {
            match bincode::deserialize::<StoredRecord>(&value) {
                Ok(stored) if stored.recipient != recipient => {
                    debug!("Skipping offline record filed under the wrong recipient");
                }
                Ok(stored) if stored.ts >= ts_since => out.push((key, stored.into())),
                Ok(_) => {}
                Err(e) => debug!("Skipping unreadable offline record: {}", e),
            }
        }
        Ok(out)
    }
}

fn prefix(recipient: &str) -> Vec<u8> {
    format!("{}{}:", OFFLINE_PREFIX, recipient).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, SledStorage};

    fn record(recipient: &str, ts: u64) -> OfflineRecord {
        OfflineRecord::new(recipient, "alice", format!("msg-{}", ts), ts)
    }

    #[test]
    fn test_retrieve_filters_by_recipient_and_time() {
        let store = OfflineStore::new(Arc::new(MemoryStorage::new()));
        store.store(&record("bob", 30)).unwrap();
        store.store(&record("bob", 10)).unwrap();
        store.store(&record("bobby", 20)).unwrap();

        let all = store.retrieve("bob", 0).unwrap();
        assert_eq!(all.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![10, 30]);
        assert_eq!(store.retrieve("bob", 11).unwrap().len(), 1);
        assert_eq!(store.count("bob").unwrap(), 2);
        // Retrieval alone never deletes
        assert_eq!(store.count("bob").unwrap(), 2);
    }

    #[test]
    fn test_take_and_purge_remove_records() {
        let store = OfflineStore::new(Arc::new(MemoryStorage::new()));
        store.store(&record("bob", 1)).unwrap();
        store.store(&record("bob", 2)).unwrap();
        store.store(&record("carol", 3)).unwrap();

        assert_eq!(store.take("bob", 2).unwrap().len(), 1);
        assert_eq!(store.count("bob").unwrap(), 1);
        assert_eq!(store.purge("bob").unwrap(), 1);
        assert_eq!(store.count("bob").unwrap(), 0);
        assert_eq!(store.count("carol").unwrap(), 1);
    }

    #[test]
    fn test_remove_leaves_records_stored_since() {
        let store = OfflineStore::new(Arc::new(MemoryStorage::new()));
        store.store(&record("bob", 1)).unwrap();
        let delivered = store.retrieve_keyed("bob", 0).unwrap();
        store.store(&record("bob", 2)).unwrap();

        let keys: Vec<_> = delivered.into_iter().map(|(key, _)| key).collect();
        store.remove(&keys).unwrap();
        let left = store.retrieve("bob", 0).unwrap();
        assert_eq!(left.iter().map(|r| r.ts).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_misfiled_record_is_not_returned() {
        let db = Arc::new(MemoryStorage::new());
        let store = OfflineStore::new(db.clone());
        store.store(&record("bob", 1)).unwrap();

        let meant_for_carol = bincode::serialize(&StoredRecord::from(&record("carol", 2))).unwrap();
        db.put(b"offline:bob:00000000000000000002:x", &meant_for_carol)
            .unwrap();

        let held = store.retrieve("bob", 0).unwrap();
        assert_eq!(held.len(), 1);
        assert!(held.iter().all(|r| r.recipient == "bob"));
        assert_eq!(store.take("bob", 0).unwrap().len(), 1);
    }

    #[test]
    fn test_signed_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline");
        let keys = crate::identity::IdentityKeys::generate();
        let mut signed = OfflineRecord::new("bob", &keys.peer_id(), "eA==".into(), 9);
        signed.sign(&keys);

        {
            let db = Arc::new(SledStorage::open(path.to_str().unwrap()).unwrap());
            OfflineStore::new(db).store(&signed).unwrap();
        }

        let db = Arc::new(SledStorage::open(path.to_str().unwrap()).unwrap());
        let loaded = OfflineStore::new(db).retrieve("bob", 0).unwrap();
        assert_eq!(loaded, vec![signed]);
        assert!(loaded[0].verify_with(&keys.public_key_bytes()));
    }
}
