// Outgoing file transfers

use super::{
    FileTransferLedger, TransferConfig, TransferError, FILE_END_PREFIX, FILE_START_PREFIX,
};
use crate::channel::{MuxError, StreamLabel, StreamSender};
use crate::signaling::short_id;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

pub struct FileSender {
    sender: Arc<dyn StreamSender>,
    ledger: Arc<FileTransferLedger>,
    config: TransferConfig,
}

impl FileSender {
    pub fn new(sender: Arc<dyn StreamSender>, ledger: Arc<FileTransferLedger>, config: TransferConfig) -> Self {
        Self {
            sender,
            ledger,
            config,
        }
    }

    /// Register an outgoing transfer of `path` to `peer_id` in the ledger
    /// without sending anything yet. Returns the transfer id.
    pub async fn prepare(&self, peer_id: &str, path: &Path) -> Result<String, TransferError> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NotFound(path.display().to_string()))?;
        self.ledger.start_outgoing(peer_id, &name, metadata.len())
    }

    /// Stream `path` to `peer_id`, returning the transfer id once `FILE_END`
    /// has been sent
    pub async fn send_file(&self, peer_id: &str, path: &Path) -> Result<String, TransferError> {
        let id = self.prepare(peer_id, path).await?;
        self.run(&id, path).await?;
        Ok(id)
    }

    /// Stream a transfer created by [`prepare`](Self::prepare)
    pub async fn run(&self, id: &str, path: &Path) -> Result<(), TransferError> {
        let record = self
            .ledger
            .get(id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        self.ledger.mark_started(id)?;
        match self.stream(id, &record.peer_id, &record.file_name, path).await {
            Ok(checksum) => {
                self.ledger.mark_completed(id, Some(checksum))?;
                info!(
                    "Sent {} to {}",
                    record.file_name,
                    short_id(&record.peer_id)
                );
                Ok(())
            }
            Err(TransferError::Cancelled(_)) => {
                debug!("Transfer {} cancelled", id);
                Err(TransferError::Cancelled(id.to_string()))
            }
            Err(e) => {
                warn!(
                    "Sending {} to {} failed: {}",
                    record.file_name,
                    short_id(&record.peer_id),
                    e
                );
                self.ledger.mark_failed(id)?;
                Err(e)
            }
        }
    }

    async fn stream(&self, id: &str, peer_id: &str, name: &str, path: &Path) -> Result<String, TransferError> {
        let mut file = tokio::fs::File::open(path).await?;
        let total = file.metadata().await?.len();

        self.sender.send_text(
            peer_id,
            StreamLabel::File,
            &format!("{}{}|{}", FILE_START_PREFIX, name, total),
        )?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            self.wait_while_paused(id).await?;
            let n = read_chunk(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            self.send_chunk(id, peer_id, &buf[..n]).await?;
            sent += n as u64;
            self.ledger.update_progress(id, sent)?;
        }

        let checksum = hex::encode(hasher.finalize());
        self.sender.send_text(
            peer_id,
            StreamLabel::File,
            &format!("{}{}", FILE_END_PREFIX, checksum),
        )?;
        Ok(checksum)
    }

    async fn wait_while_paused(&self, id: &str) -> Result<(), TransferError> {
        loop {
            if self.ledger.is_cancelled(id) {
                return Err(TransferError::Cancelled(id.to_string()));
            }
            if !self.ledger.is_paused(id) {
                return Ok(());
            }
            tokio::time::sleep(self.config.pause_poll).await;
        }
    }

    async fn send_chunk(&self, id: &str, peer_id: &str, chunk: &[u8]) -> Result<(), TransferError> {
        loop {
            match self.sender.send_binary(peer_id, StreamLabel::File, chunk) {
                Ok(()) => return Ok(()),
                Err(MuxError::Backpressure { .. }) => {
                    if self.ledger.is_cancelled(id) {
                        return Err(TransferError::Cancelled(id.to_string()));
                    }
                    tokio::time::sleep(self.config.send_retry).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Fill `buf` unless the file ends first
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
