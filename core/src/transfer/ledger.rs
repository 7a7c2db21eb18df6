// File transfer ledger
//
// Every transfer in either direction has one record, persisted under
// `transfer:<id>` and published as a snapshot on a watch channel. Progress
// only moves forward. Outgoing records stay pending until the sender starts
// streaming. A record still in progress when the node stopped is loaded as
// paused.

use super::TransferError;
use crate::store::{StorageBackend, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

const TRANSFER_PREFIX: &str = "transfer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Registered, nothing sent yet
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub peer_id: String,
    pub file_name: String,
    pub direction: TransferDirection,
    /// `None` when the sender did not announce a size
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub checksum: Option<String>,
    pub started_at: u64,
    pub updated_at: u64,
}

pub type LedgerSnapshot = HashMap<String, TransferRecord>;

pub struct FileTransferLedger {
    db: Arc<dyn StorageBackend>,
    guard: Mutex<()>,
    tx: watch::Sender<LedgerSnapshot>,
}

impl FileTransferLedger {
    pub fn open(db: Arc<dyn StorageBackend>) -> Result<Self, TransferError> {
        let mut records = HashMap::new();
        for (key, value) in db.scan_prefix(TRANSFER_PREFIX.as_bytes())? {
            let mut record = match bincode::deserialize::<TransferRecord>(&value) {
                Ok(record) => record,
                Err(e) => {
                    debug!(
                        "Skipping unreadable transfer {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    continue;
                }
            };
            if record.status == TransferStatus::InProgress {
                record.status = TransferStatus::Paused;
                persist(db.as_ref(), &record)?;
            }
            records.insert(record.id.clone(), record);
        }
        db.flush()?;
        if !records.is_empty() {
            info!("Loaded {} file transfers", records.len());
        }

        let (tx, _rx) = watch::channel(records);
        Ok(Self {
            db,
            guard: Mutex::new(()),
            tx,
        })
    }

    pub fn start_incoming(
        &self,
        peer_id: &str,
        file_name: &str,
        total_bytes: Option<u64>,
    ) -> Result<String, TransferError> {
        self.start(
            peer_id,
            file_name,
            total_bytes,
            TransferDirection::Incoming,
            TransferStatus::InProgress,
        )
    }

    pub fn start_outgoing(&self, peer_id: &str, file_name: &str, total_bytes: u64) -> Result<String, TransferError> {
        self.start(
            peer_id,
            file_name,
            Some(total_bytes),
            TransferDirection::Outgoing,
            TransferStatus::Pending,
        )
    }

    fn start(
        &self,
        peer_id: &str,
        file_name: &str,
        total_bytes: Option<u64>,
        direction: TransferDirection,
        status: TransferStatus,
    ) -> Result<String, TransferError> {
        let now = crate::offline::manager::now_millis();
        let record = TransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            file_name: file_name.to_string(),
            direction,
            total_bytes,
            transferred_bytes: 0,
            status,
            checksum: None,
            started_at: now,
            updated_at: now,
        };
        let id = record.id.clone();
        let _guard = self.guard.lock();
        self.commit(record)?;
        Ok(id)
    }

    /// Pending -> InProgress, once the first bytes are about to move
    pub fn mark_started(&self, id: &str) -> Result<bool, TransferError> {
        self.transition(id, TransferStatus::InProgress, |s| s == TransferStatus::Pending)
    }

    /// Raise progress to `bytes`; lower values are ignored
    pub fn update_progress(&self, id: &str, bytes: u64) -> Result<bool, TransferError> {
        self.modify(id, |r| {
            if r.status.is_terminal() || bytes <= r.transferred_bytes {
                return false;
            }
            r.transferred_bytes = bytes;
            true
        })
    }

    pub fn mark_completed(&self, id: &str, checksum: Option<String>) -> Result<bool, TransferError> {
        self.modify(id, |r| {
            if r.status.is_terminal() {
                return false;
            }
            r.status = TransferStatus::Completed;
            r.checksum = checksum;
            true
        })
    }

    pub fn mark_failed(&self, id: &str) -> Result<bool, TransferError> {
        self.transition(id, TransferStatus::Failed, |s| !s.is_terminal())
    }

    pub fn pause(&self, id: &str) -> Result<bool, TransferError> {
        self.transition(id, TransferStatus::Paused, |s| {
            matches!(s, TransferStatus::Pending | TransferStatus::InProgress)
        })
    }

    pub fn resume(&self, id: &str) -> Result<bool, TransferError> {
        self.transition(id, TransferStatus::InProgress, |s| s == TransferStatus::Paused)
    }

    pub fn cancel(&self, id: &str) -> Result<bool, TransferError> {
        self.transition(id, TransferStatus::Cancelled, |s| !s.is_terminal())
    }

    pub fn is_paused(&self, id: &str) -> bool {
        self.status(id) == Some(TransferStatus::Paused)
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.status(id) == Some(TransferStatus::Cancelled)
    }

    pub fn status(&self, id: &str) -> Option<TransferStatus> {
        self.tx.borrow().get(id).map(|r| r.status)
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        self.tx.borrow().get(id).cloned()
    }

    /// All records, oldest first
    pub fn all(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self.tx.borrow().values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn subscribe(&self) -> watch::Receiver<LedgerSnapshot> {
        self.tx.subscribe()
    }

    fn transition(
        &self,
        id: &str,
        to: TransferStatus,
        allowed: impl FnOnce(TransferStatus) -> bool,
    ) -> Result<bool, TransferError> {
        self.modify(id, |r| {
            if !allowed(r.status) {
                return false;
            }
            r.status = to;
            true
        })
    }

    fn modify(&self, id: &str, apply: impl FnOnce(&mut TransferRecord) -> bool) -> Result<bool, TransferError> {
        let _guard = self.guard.lock();
        let mut record = self
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if !apply(&mut record) {
            return Ok(false);
        }
        record.updated_at = crate::offline::manager::now_millis();
        self.commit(record)?;
        Ok(true)
    }

    fn commit(&self, record: TransferRecord) -> Result<(), TransferError> {
        persist(self.db.as_ref(), &record)?;
        self.db.flush()?;
        self.tx.send_modify(|map| {
            map.insert(record.id.clone(), record);
        });
        Ok(())
    }
}

fn persist(db: &dyn StorageBackend, record: &TransferRecord) -> Result<(), StorageError> {
    let key = format!("{}{}", TRANSFER_PREFIX, record.id);
    let bytes =
        bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    db.put(key.as_bytes(), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, SledStorage};

    fn ledger() -> FileTransferLedger {
        FileTransferLedger::open(Arc::new(MemoryStorage::new())).unwrap()
    }

    #[test]
    fn test_progress_is_monotonic() {
        let ledger = ledger();
        let id = ledger.start_incoming("bob", "a.bin", Some(100)).unwrap();
        assert!(ledger.update_progress(&id, 40).unwrap());
        assert!(!ledger.update_progress(&id, 10).unwrap());
        assert_eq!(ledger.get(&id).unwrap().transferred_bytes, 40);

        assert!(ledger.mark_completed(&id, Some("ff".into())).unwrap());
        assert!(!ledger.update_progress(&id, 100).unwrap());
        assert_eq!(ledger.get(&id).unwrap().checksum.as_deref(), Some("ff"));
    }

    #[test]
    fn test_pause_resume_cancel() {
        let ledger = ledger();
        let id = ledger.start_outgoing("bob", "a.bin", 10).unwrap();
        assert!(!ledger.resume(&id).unwrap());
        assert!(ledger.pause(&id).unwrap());
        assert!(ledger.is_paused(&id));
        assert!(ledger.resume(&id).unwrap());
        assert!(ledger.cancel(&id).unwrap());
        assert!(ledger.is_cancelled(&id));
        assert!(!ledger.pause(&id).unwrap());
        assert!(!ledger.mark_failed(&id).unwrap());
        assert!(matches!(
            ledger.pause("missing"),
            Err(TransferError::NotFound(_))
        ));
    }

    #[test]
    fn test_watch_publishes_changes() {
        let ledger = ledger();
        let mut rx = ledger.subscribe();
        let id = ledger.start_incoming("bob", "a.bin", None).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().get(&id).map(|r| r.status),
            Some(TransferStatus::InProgress)
        );
        let outgoing = ledger.start_outgoing("bob", "b.bin", 10).unwrap();
        assert_eq!(ledger.status(&outgoing), Some(TransferStatus::Pending));
        assert!(ledger.mark_started(&outgoing).unwrap());
        assert!(!ledger.mark_started(&outgoing).unwrap());
        ledger.mark_failed(&id).unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_in_progress_loads_as_paused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        let (running, done) = {
            let db = Arc::new(SledStorage::open(path.to_str().unwrap()).unwrap());
            let ledger = FileTransferLedger::open(db).unwrap();
            let running = ledger.start_outgoing("bob", "a.bin", 10).unwrap();
            ledger.mark_started(&running).unwrap();
            ledger.update_progress(&running, 5).unwrap();
            let done = ledger.start_incoming("carol", "b.bin", Some(3)).unwrap();
            ledger.mark_completed(&done, None).unwrap();
            (running, done)
        };

        let db = Arc::new(SledStorage::open(path.to_str().unwrap()).unwrap());
        let ledger = FileTransferLedger::open(db).unwrap();
        let record = ledger.get(&running).unwrap();
        assert_eq!(record.status, TransferStatus::Paused);
        assert_eq!(record.transferred_bytes, 5);
        assert_eq!(ledger.status(&done), Some(TransferStatus::Completed));
        assert_eq!(ledger.all().len(), 2);
    }
}
