// Storage abstraction for durable records
//
// The offline-message store and the transfer ledger are the only components
// that need crash-consistent persistence. Both go through this trait so the
// same code runs against sled on disk or a map in tests.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Unified key-value trait for durable records
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn remove(&self, key: &[u8]) -> Result<(), StorageError>;
    /// Entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// In-memory storage useful for testing and ephemeral nodes
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db
            .insert(key, value)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        // Every write is flushed: records must survive a crash right after append.
        self.flush()
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .remove(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.flush()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item.map_err(|e| StorageError::Backend(e.to_string()))?;
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        Ok(self.db.scan_prefix(prefix).count())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn StorageBackend) {
        backend.put(b"offline_bob_1", b"one").unwrap();
        backend.put(b"offline_bob_2", b"two").unwrap();
        backend.put(b"offline_carol_1", b"three").unwrap();

        assert_eq!(backend.get(b"offline_bob_1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.count_prefix(b"offline_bob_").unwrap(), 2);

        let scanned = backend.scan_prefix(b"offline_bob_").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].1, b"one".to_vec());

        backend.remove(b"offline_bob_1").unwrap();
        assert_eq!(backend.get(b"offline_bob_1").unwrap(), None);
        assert_eq!(backend.count_prefix(b"offline_").unwrap(), 2);
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(dir.path().to_str().unwrap()).unwrap();
        exercise(&storage);
    }

    #[test]
    fn test_sled_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        {
            let storage = SledStorage::open(&path).unwrap();
            storage.put(b"ledger_x", b"record").unwrap();
        }
        let storage = SledStorage::open(&path).unwrap();
        assert_eq!(storage.get(b"ledger_x").unwrap(), Some(b"record".to_vec()));
    }
}
