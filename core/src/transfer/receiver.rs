// Incoming file transfers

use super::{
    sanitize_name, FileTransferLedger, TransferError, FILE_END_PREFIX, FILE_START_PREFIX,
};
use crate::signaling::short_id;
use crate::trust::TrustDirectory;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where received bytes go
pub trait TransferSink: Send + Sync {
    fn begin(&self, transfer_id: &str, file_name: &str, total_bytes: Option<u64>) -> io::Result<()>;
    fn write(&self, transfer_id: &str, data: &[u8]) -> io::Result<()>;
    /// `success` is false when the transfer failed or was cancelled
    fn finish(&self, transfer_id: &str, success: bool) -> io::Result<()>;
}

struct PartFile {
    part: PathBuf,
    file_name: String,
    file: File,
}

/// Writes each transfer to a hidden `.part` file in `dir` and renames it to
/// the announced name once verified. An existing file is never overwritten;
/// the new one gets a ` (n)` suffix instead.
pub struct DirectorySink {
    dir: PathBuf,
    open: Mutex<HashMap<String, PartFile>>,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            open: Mutex::new(HashMap::new()),
        })
    }
}

impl TransferSink for DirectorySink {
    fn begin(&self, transfer_id: &str, file_name: &str, _total_bytes: Option<u64>) -> io::Result<()> {
        let part = self.dir.join(format!(".{}.{}.part", file_name, transfer_id));
        let file = OpenOptions::new().write(true).create_new(true).open(&part)?;
        self.open.lock().insert(
            transfer_id.to_string(),
            PartFile {
                part,
                file_name: file_name.to_string(),
                file,
            },
        );
        Ok(())
    }

    fn write(&self, transfer_id: &str, data: &[u8]) -> io::Result<()> {
        let mut open = self.open.lock();
        let part = open
            .get_mut(transfer_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "transfer not open"))?;
        part.file.write_all(data)
    }

    fn finish(&self, transfer_id: &str, success: bool) -> io::Result<()> {
        let Some(PartFile {
            part,
            file_name,
            mut file,
        }) = self.open.lock().remove(transfer_id)
        else {
            return Ok(());
        };
        if !success {
            drop(file);
            return std::fs::remove_file(part);
        }
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(part, free_path(&self.dir, &file_name))
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first `n` not already taken
fn free_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, extension));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Split `<name>|<total>`. The size is optional and the name may itself
/// contain `|`, so only a numeric suffix after the last `|` counts as a size.
fn parse_header(header: &str) -> (&str, Option<u64>) {
    match header.rsplit_once('|') {
        Some((name, total)) => match total.trim().parse() {
            Ok(total) => (name, Some(total)),
            Err(_) => (header, None),
        },
        None => (header, None),
    }
}

struct Incoming {
    id: String,
    file_name: String,
    total: Option<u64>,
    received: u64,
    hasher: Sha256,
}

pub struct FileReceiver {
    ledger: Arc<FileTransferLedger>,
    sink: Arc<dyn TransferSink>,
    trust: Arc<dyn TrustDirectory>,
    /// At most one incoming transfer per peer; the file stream is ordered
    active: Mutex<HashMap<String, Incoming>>,
}

impl FileReceiver {
    pub fn new(
        ledger: Arc<FileTransferLedger>,
        sink: Arc<dyn TransferSink>,
        trust: Arc<dyn TrustDirectory>,
    ) -> Self {
        Self {
            ledger,
            sink,
            trust,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Id of the transfer currently arriving from `peer_id`
    pub fn active_transfer(&self, peer_id: &str) -> Option<String> {
        self.active.lock().get(peer_id).map(|t| t.id.clone())
    }

    /// Handle `FILE_START` / `FILE_END`. Returns false for other text.
    pub fn handle_text(&self, peer_id: &str, text: &str) -> bool {
        if let Some(header) = text.strip_prefix(FILE_START_PREFIX) {
            if let Err(e) = self.start(peer_id, header) {
                warn!("Rejected file from {}: {}", short_id(peer_id), e);
            }
            true
        } else if let Some(checksum) = text.strip_prefix(FILE_END_PREFIX) {
            self.finish(peer_id, checksum.trim());
            true
        } else {
            false
        }
    }

    pub fn handle_chunk(&self, peer_id: &str, data: &[u8]) {
        let mut active = self.active.lock();
        let Some(transfer) = active.get_mut(peer_id) else {
            debug!("Chunk from {} with no transfer in progress", short_id(peer_id));
            return;
        };
        if self.ledger.is_cancelled(&transfer.id) {
            return;
        }
        if let Err(e) = self.sink.write(&transfer.id, data) {
            warn!("Writing {} failed: {}", transfer.file_name, e);
            let failed = active.remove(peer_id);
            drop(active);
            if let Some(transfer) = failed {
                self.fail(peer_id, transfer);
            }
            return;
        }
        transfer.hasher.update(data);
        transfer.received += data.len() as u64;
        if let Err(e) = self.ledger.update_progress(&transfer.id, transfer.received) {
            debug!("Progress update for {} failed: {}", transfer.id, e);
        }
    }

    /// Fail whatever was arriving from a peer that went away
    pub fn handle_peer_closed(&self, peer_id: &str) {
        let transfer = self.active.lock().remove(peer_id);
        if let Some(transfer) = transfer {
            info!("{} disconnected mid-transfer", short_id(peer_id));
            self.fail(peer_id, transfer);
        }
    }

    fn start(&self, peer_id: &str, header: &str) -> Result<(), TransferError> {
        let (name, total) = parse_header(header);
        let file_name = sanitize_name(name)
            .ok_or_else(|| TransferError::InvalidHeader(header.to_string()))?
            .to_string();

        let previous = self.active.lock().remove(peer_id);
        if let Some(previous) = previous {
            debug!("New file from {} replaces {}", short_id(peer_id), previous.file_name);
            self.fail(peer_id, previous);
        }

        let id = self.ledger.start_incoming(peer_id, &file_name, total)?;
        if let Err(e) = self.sink.begin(&id, &file_name, total) {
            self.ledger.mark_failed(&id)?;
            return Err(e.into());
        }
        match total {
            Some(total) => info!(
                "Receiving {} ({} bytes) from {}",
                file_name,
                total,
                short_id(peer_id)
            ),
            None => info!("Receiving {} from {}", file_name, short_id(peer_id)),
        }
        self.active.lock().insert(
            peer_id.to_string(),
            Incoming {
                id,
                file_name,
                total,
                received: 0,
                hasher: Sha256::new(),
            },
        );
        Ok(())
    }

    fn finish(&self, peer_id: &str, expected: &str) {
        let Some(transfer) = self.active.lock().remove(peer_id) else {
            debug!("FILE_END from {} with no transfer in progress", short_id(peer_id));
            return;
        };
        if self.ledger.is_cancelled(&transfer.id) {
            self.discard(&transfer);
            return;
        }

        let Incoming {
            id,
            file_name,
            total,
            received,
            hasher,
        } = transfer;
        let actual = hex::encode(hasher.finalize());
        let complete = total.map_or(true, |total| received == total);
        let verified = actual.eq_ignore_ascii_case(expected) && complete;
        if !verified {
            warn!(
                "Checksum mismatch for {} from {} ({} of {:?} bytes)",
                file_name,
                short_id(peer_id),
                received,
                total
            );
        }

        // A verified file that cannot be put in place still counts as failed
        let ok = match self.sink.finish(&id, verified) {
            Ok(()) => verified,
            Err(e) => {
                warn!("Closing {} failed: {}", file_name, e);
                false
            }
        };
        let recorded = if ok {
            info!("Received {} from {}", file_name, short_id(peer_id));
            self.ledger.mark_completed(&id, Some(actual))
        } else {
            self.ledger.mark_failed(&id)
        };
        if let Err(e) = recorded {
            debug!("Ledger update for {} failed: {}", id, e);
        }
        self.trust.record_transfer_outcome(peer_id, ok, received);
    }

    fn fail(&self, peer_id: &str, transfer: Incoming) {
        self.discard(&transfer);
        if let Err(e) = self.ledger.mark_failed(&transfer.id) {
            debug!("Ledger update for {} failed: {}", transfer.id, e);
        }
        self.trust
            .record_transfer_outcome(peer_id, false, transfer.received);
    }

    fn discard(&self, transfer: &Incoming) {
        if let Err(e) = self.sink.finish(&transfer.id, false) {
            warn!("Discarding {} failed: {}", transfer.file_name, e);
        }
    }

    fn apply(&self, peer_id: &str, item: Inbound) {
        match item {
            Inbound::Text(text) => {
                if !self.handle_text(peer_id, &text) {
                    debug!("Unknown file control from {}", short_id(peer_id));
                }
            }
            Inbound::Chunk(data) => self.handle_chunk(peer_id, &data),
            Inbound::Closed => self.handle_peer_closed(peer_id),
        }
    }
}

enum Inbound {
    Text(String),
    Chunk(Vec<u8>),
    Closed,
}

/// Feeds a [`FileReceiver`] from the engine event loop without blocking it.
///
/// Each peer gets a worker task that applies its file traffic in arrival
/// order, one item at a time on the blocking pool, since sink writes and
/// ledger commits touch the disk. Without a runtime items are applied inline.
pub struct ReceiveQueue {
    receiver: Arc<FileReceiver>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>,
}

impl ReceiveQueue {
    pub fn new(receiver: Arc<FileReceiver>) -> Self {
        Self {
            receiver,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn receiver(&self) -> &Arc<FileReceiver> {
        &self.receiver
    }

    pub fn push_text(&self, peer_id: &str, text: &str) {
        self.push(peer_id, Inbound::Text(text.to_string()));
    }

    pub fn push_chunk(&self, peer_id: &str, data: &[u8]) {
        self.push(peer_id, Inbound::Chunk(data.to_vec()));
    }

    /// Queued behind whatever already arrived from `peer_id`
    pub fn peer_closed(&self, peer_id: &str) {
        self.push(peer_id, Inbound::Closed);
    }

    fn push(&self, peer_id: &str, item: Inbound) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.receiver.apply(peer_id, item);
            return;
        };
        let mut workers = self.workers.lock();
        let worker = workers
            .entry(peer_id.to_string())
            .or_insert_with(|| self.spawn_worker(&runtime, peer_id));
        if let Err(mpsc::error::SendError(item)) = worker.send(item) {
            let worker = self.spawn_worker(&runtime, peer_id);
            if worker.send(item).is_ok() {
                workers.insert(peer_id.to_string(), worker);
            }
        }
    }

    fn spawn_worker(
        &self,
        runtime: &tokio::runtime::Handle,
        peer_id: &str,
    ) -> mpsc::UnboundedSender<Inbound> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let receiver = self.receiver.clone();
        let peer_id = peer_id.to_string();
        runtime.spawn(async move {
            while let Some(item) = rx.recv().await {
                let receiver = receiver.clone();
                let peer = peer_id.clone();
                let applied =
                    tokio::task::spawn_blocking(move || receiver.apply(&peer, item)).await;
                if let Err(e) = applied {
                    warn!("File traffic from {} dropped: {}", short_id(&peer_id), e);
                }
            }
        });
        tx
    }
}
