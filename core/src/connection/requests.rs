// Pairing request registry
//
// One entry per peer with a pending request in either direction. An entry
// whose flags are both false is removed rather than stored, so absence means
// "nothing pending". Snapshots are published on a watch channel for UIs.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionRequestState {
    /// We asked this peer to pair
    pub outgoing: bool,
    /// This peer asked us to pair
    pub incoming: bool,
}

pub type RequestSnapshot = HashMap<String, ConnectionRequestState>;

pub struct ConnectionRequestRegistry {
    // Serializes read-modify-write so concurrent marks cannot lose updates
    guard: Mutex<()>,
    tx: watch::Sender<RequestSnapshot>,
}

impl Default for ConnectionRequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRequestRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HashMap::new());
        Self {
            guard: Mutex::new(()),
            tx,
        }
    }

    pub fn mark_outgoing(&self, peer_id: &str) {
        self.update(peer_id, |s| s.outgoing = true);
    }

    pub fn mark_incoming(&self, peer_id: &str) {
        self.update(peer_id, |s| s.incoming = true);
    }

    pub fn clear_outgoing(&self, peer_id: &str) {
        self.update(peer_id, |s| s.outgoing = false);
    }

    pub fn clear_incoming(&self, peer_id: &str) {
        self.update(peer_id, |s| s.incoming = false);
    }

    /// Drop any pending request with `peer_id`
    pub fn clear(&self, peer_id: &str) {
        self.update(peer_id, |s| *s = ConnectionRequestState::default());
    }

    pub fn get(&self, peer_id: &str) -> Option<ConnectionRequestState> {
        self.tx.borrow().get(peer_id).copied()
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestSnapshot> {
        self.tx.subscribe()
    }

    fn update(&self, peer_id: &str, apply: impl FnOnce(&mut ConnectionRequestState)) {
        let _guard = self.guard.lock();
        let mut state = self.get(peer_id).unwrap_or_default();
        apply(&mut state);

        let current = self.get(peer_id);
        let keep = state.outgoing || state.incoming;
        if (keep && current == Some(state)) || (!keep && current.is_none()) {
            return;
        }
        self.tx.send_modify(|map| {
            if keep {
                map.insert(peer_id.to_string(), state);
            } else {
                map.remove(peer_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_removed_when_both_flags_clear() {
        let registry = ConnectionRequestRegistry::new();
        registry.mark_outgoing("bob");
        registry.mark_incoming("bob");
        assert_eq!(
            registry.get("bob"),
            Some(ConnectionRequestState {
                outgoing: true,
                incoming: true
            })
        );

        registry.clear_outgoing("bob");
        assert_eq!(
            registry.get("bob"),
            Some(ConnectionRequestState {
                outgoing: false,
                incoming: true
            })
        );

        registry.clear_incoming("bob");
        assert_eq!(registry.get("bob"), None);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_clearing_unknown_peer_creates_nothing() {
        let registry = ConnectionRequestRegistry::new();
        registry.clear_incoming("ghost");
        registry.clear("ghost");
        assert_eq!(registry.get("ghost"), None);
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let registry = ConnectionRequestRegistry::new();
        let mut rx = registry.subscribe();

        registry.mark_incoming("carol");
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update()["carol"].incoming);

        registry.clear("carol");
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[test]
    fn test_no_entry_ever_has_both_flags_false() {
        let registry = ConnectionRequestRegistry::new();
        let ops: [fn(&ConnectionRequestRegistry, &str); 5] = [
            ConnectionRequestRegistry::mark_outgoing,
            ConnectionRequestRegistry::mark_incoming,
            ConnectionRequestRegistry::clear_outgoing,
            ConnectionRequestRegistry::clear_incoming,
            ConnectionRequestRegistry::clear,
        ];
        for i in 0..50usize {
            ops[(i * 7 + i / 3) % ops.len()](&registry, "p");
            for state in registry.snapshot().values() {
                assert!(state.outgoing || state.incoming);
            }
        }
    }
}
