// Trust directory: read-mostly view of how much we trust each peer
//
// Levels run 0..=5. Scoring and certificate rotation live outside the core;
// the core only queries levels and reports transfer outcomes.

use parking_lot::RwLock;
use std::collections::HashMap;

pub const MAX_TRUST_LEVEL: u8 = 5;

/// Outcome statistics accumulated per peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub successes: u64,
    pub failures: u64,
    pub bytes: u64,
}

#[cfg_attr(test, mockall::automock)]
pub trait TrustDirectory: Send + Sync {
    /// Trust level for a peer, `None` if the peer is unknown
    fn trust_level(&self, peer_id: &str) -> Option<u8>;

    /// Record the outcome of a file transfer with `peer_id`
    fn record_transfer_outcome(&self, peer_id: &str, success: bool, bytes: u64);
}

/// In-memory directory used by the CLI and tests
#[derive(Default)]
pub struct MemoryTrustDirectory {
    levels: RwLock<HashMap<String, u8>>,
    stats: RwLock<HashMap<String, TransferStats>>,
}

impl MemoryTrustDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&self, peer_id: &str, level: u8) {
        self.levels
            .write()
            .insert(peer_id.to_string(), level.min(MAX_TRUST_LEVEL));
    }

    pub fn stats(&self, peer_id: &str) -> TransferStats {
        self.stats.read().get(peer_id).copied().unwrap_or_default()
    }
}

impl TrustDirectory for MemoryTrustDirectory {
    fn trust_level(&self, peer_id: &str) -> Option<u8> {
        self.levels.read().get(peer_id).copied()
    }

    fn record_transfer_outcome(&self, peer_id: &str, success: bool, bytes: u64) {
        let mut stats = self.stats.write();
        let entry = stats.entry(peer_id.to_string()).or_default();
        if success {
            entry.successes += 1;
            entry.bytes += bytes;
        } else {
            entry.failures += 1;
        }
    }
}
