// Offline store-and-forward

pub mod manager;
pub mod protocol;
pub mod store;

pub use manager::{BundleListener, OfflineConfig, OfflineManager, DEFAULT_RELAY_TRUST_THRESHOLD};
pub use protocol::{OfflineBundle, OfflineMessage, OfflineRecord, RetrieveRequest};
pub use store::{OfflineStore, RecordKey};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::StorageError),
    #[error("Send failed: {0}")]
    Send(#[from] crate::channel::MuxError),
}
