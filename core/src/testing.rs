// Shared fakes for unit tests

use crate::channel::{MuxError, StreamLabel, StreamSender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Records everything sent through it. Peers count as connected on every
/// stream once added with [`RecordingSender::connect`].
#[derive(Default)]
pub struct RecordingSender {
    connected: RwLock<HashSet<String>>,
    pub texts: Mutex<Vec<(String, StreamLabel, String)>>,
    pub binaries: Mutex<Vec<(String, StreamLabel, Vec<u8>)>>,
    /// Binary sends to reject with backpressure before accepting again
    reject_binary: AtomicUsize,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer_id: &str) {
        self.connected.write().insert(peer_id.to_string());
    }

    pub fn disconnect(&self, peer_id: &str) {
        self.connected.write().remove(peer_id);
    }

    pub fn reject_next_binaries(&self, count: usize) {
        self.reject_binary.store(count, Ordering::SeqCst);
    }

    pub fn texts_to(&self, peer_id: &str, label: StreamLabel) -> Vec<String> {
        self.texts
            .lock()
            .iter()
            .filter(|(p, l, _)| p == peer_id && *l == label)
            .map(|(_, _, t)| t.clone())
            .collect()
    }

    pub fn binaries_to(&self, peer_id: &str, label: StreamLabel) -> Vec<Vec<u8>> {
        self.binaries
            .lock()
            .iter()
            .filter(|(p, l, _)| p == peer_id && *l == label)
            .map(|(_, _, b)| b.clone())
            .collect()
    }

    fn check(&self, peer_id: &str, label: StreamLabel) -> Result<(), MuxError> {
        if self.connected.read().contains(peer_id) {
            Ok(())
        } else {
            Err(MuxError::NoChannel {
                peer: peer_id.to_string(),
                label,
            })
        }
    }
}

impl StreamSender for RecordingSender {
    fn send_text(&self, peer_id: &str, label: StreamLabel, text: &str) -> Result<(), MuxError> {
        self.check(peer_id, label)?;
        self.texts
            .lock()
            .push((peer_id.to_string(), label, text.to_string()));
        Ok(())
    }

    fn send_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) -> Result<(), MuxError> {
        self.check(peer_id, label)?;
        let rejected = self
            .reject_binary
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(MuxError::Backpressure { buffered: u64::MAX });
        }
        self.binaries
            .lock()
            .push((peer_id.to_string(), label, data.to_vec()));
        Ok(())
    }

    fn is_connected(&self, peer_id: &str, _label: StreamLabel) -> bool {
        self.connected.read().contains(peer_id)
    }

    fn connected_peers(&self, _label: StreamLabel) -> Vec<String> {
        let mut peers: Vec<String> = self.connected.read().iter().cloned().collect();
        peers.sort();
        peers
    }
}
