// File transfer over the `file` stream
//
// Text frames carry control (`FILE_START:<name>[|<total>]`, `FILE_END:<sha256>`,
// `FILE_REQUEST:<name>`), binary frames carry the content in order.

pub mod ledger;
pub mod receiver;
pub mod sender;

pub use ledger::{
    FileTransferLedger, LedgerSnapshot, TransferDirection, TransferRecord, TransferStatus,
};
pub use receiver::{DirectorySink, FileReceiver, ReceiveQueue, TransferSink};
pub use sender::FileSender;

use std::time::Duration;
use thiserror::Error;

pub const FILE_START_PREFIX: &str = "FILE_START:";
pub const FILE_END_PREFIX: &str = "FILE_END:";
pub const FILE_REQUEST_PREFIX: &str = "FILE_REQUEST:";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// How often a paused transfer checks whether it may continue
    pub pause_poll: Duration,
    /// Delay before resending a chunk refused for backpressure
    pub send_retry: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pause_poll: Duration::from_millis(200),
            send_retry: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] crate::store::StorageError),
    #[error("Send failed: {0}")]
    Send(#[from] crate::channel::MuxError),
    #[error("Unknown transfer: {0}")]
    NotFound(String),
    #[error("Invalid transfer header: {0}")]
    InvalidHeader(String),
    #[error("Transfer cancelled: {0}")]
    Cancelled(String),
}

/// Last path component, so a peer cannot name a file outside the target dir
pub(crate) fn sanitize_name(name: &str) -> Option<&str> {
    let name = name.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
