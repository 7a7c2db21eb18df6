// Relay coordinator

use super::framing::{
    format_control, format_relay_request, pack, parse_control, parse_relay_request, unpack,
};
use super::RelayError;
use crate::channel::{StreamLabel, StreamSender};
use crate::offline::OfflineManager;
use crate::search::{DiscoveryKind, DiscoveryMessage};
use crate::signaling::short_id;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A session this node forwards between `peer_a` (who asked) and `peer_c`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySession {
    pub id: Uuid,
    pub peer_a: String,
    pub peer_c: String,
}

impl RelaySession {
    /// The endpoint opposite `from`, or `None` if `from` is not a party
    pub fn other_side(&self, from: &str) -> Option<&str> {
        if from == self.peer_a {
            Some(&self.peer_c)
        } else if from == self.peer_c {
            Some(&self.peer_a)
        } else {
            None
        }
    }
}

pub type ReadyListener = Box<dyn FnOnce(Uuid) + Send>;
/// Called with `(from, message)`
pub type ControlListener = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Called with `(from, payload)`
pub type DataListener = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub struct RelayCoordinator {
    local_id: String,
    sender: Arc<dyn StreamSender>,
    offline: Arc<OfflineManager>,
    sessions: RwLock<HashMap<Uuid, RelaySession>>,
    /// Sessions we asked for, keyed by id: (relay peer, listener)
    pending: Mutex<HashMap<Uuid, (String, ReadyListener)>>,
    control_listeners: RwLock<HashMap<Uuid, ControlListener>>,
    data_listeners: RwLock<HashMap<Uuid, DataListener>>,
}

impl RelayCoordinator {
    pub fn new(local_id: &str, sender: Arc<dyn StreamSender>, offline: Arc<OfflineManager>) -> Self {
        Self {
            local_id: local_id.to_string(),
            sender,
            offline,
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            control_listeners: RwLock::new(HashMap::new()),
            data_listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Ask `relay_peer` to forward between us and `target`.
    /// `on_ready` fires once the relay confirms the session.
    pub fn request_relay(
        &self,
        relay_peer: &str,
        target: &str,
        on_ready: ReadyListener,
    ) -> Result<Uuid, RelayError> {
        let session_id = Uuid::new_v4();
        self.pending
            .lock()
            .insert(session_id, (relay_peer.to_string(), on_ready));

        let message = DiscoveryMessage::new(
            DiscoveryKind::RelayRequest,
            format_relay_request(target, session_id),
        );
        let sent = message
            .to_json()
            .map_err(|e| RelayError::Serialization(e.to_string()))
            .and_then(|json| {
                self.sender
                    .send_text(relay_peer, StreamLabel::Discovery, &json)
                    .map_err(RelayError::from)
            });
        if let Err(e) = sent {
            self.pending.lock().remove(&session_id);
            return Err(e);
        }
        info!(
            "Requested relay {} via {} to {}",
            session_id,
            short_id(relay_peer),
            short_id(target)
        );
        Ok(session_id)
    }

    /// Dispatch a `relay_request` / `relay_ready` discovery message
    pub fn handle_discovery(&self, from: &str, message: &DiscoveryMessage) {
        match message.kind {
            DiscoveryKind::RelayRequest => self.handle_relay_request(from, &message.payload),
            DiscoveryKind::RelayReady => self.handle_relay_ready(from, &message.payload),
            DiscoveryKind::Search | DiscoveryKind::Response => {}
        }
    }

    /// Intermediary side of relay setup
    pub fn handle_relay_request(&self, from: &str, payload: &str) {
        let Some((target, session_id)) = parse_relay_request(payload) else {
            debug!("Malformed relay request from {}", short_id(from));
            return;
        };
        if target == from || target == self.local_id {
            debug!("Ignoring relay request from {} to {}", short_id(from), short_id(target));
            return;
        }
        {
            let mut sessions = self.sessions.write();
            if let Some(existing) = sessions.get(&session_id) {
                debug!(
                    "Relay session {} already recorded between {} and {}, ignoring request from {}",
                    session_id,
                    short_id(&existing.peer_a),
                    short_id(&existing.peer_c),
                    short_id(from)
                );
                return;
            }
            sessions.insert(
                session_id,
                RelaySession {
                    id: session_id,
                    peer_a: from.to_string(),
                    peer_c: target.to_string(),
                },
            );
        }
        info!(
            "Relaying session {} between {} and {}",
            session_id,
            short_id(from),
            short_id(target)
        );

        let ready = DiscoveryMessage::new(DiscoveryKind::RelayReady, session_id.to_string());
        let sent = ready.to_json().map_err(|e| e.to_string()).and_then(|json| {
            self.sender
                .send_text(from, StreamLabel::Discovery, &json)
                .map_err(|e| e.to_string())
        });
        if let Err(e) = sent {
            debug!("Could not confirm relay {} to {}: {}", session_id, short_id(from), e);
        }
    }

    /// Endpoint side of relay setup
    pub fn handle_relay_ready(&self, from: &str, payload: &str) {
        let Ok(session_id) = Uuid::parse_str(payload.trim()) else {
            debug!("Malformed relay ready from {}", short_id(from));
            return;
        };
        let listener = {
            let mut pending = self.pending.lock();
            let from_relay = pending
                .get(&session_id)
                .map_or(false, |(relay, _)| relay == from);
            if from_relay {
                pending.remove(&session_id)
            } else {
                None
            }
        };
        match listener {
            Some((_, on_ready)) => on_ready(session_id),
            None => debug!("Unexpected relay ready {} from {}", session_id, short_id(from)),
        }
    }

    pub fn register_control_listener(&self, session_id: Uuid, listener: ControlListener) {
        self.control_listeners.write().insert(session_id, listener);
    }

    pub fn register_data_listener(&self, session_id: Uuid, listener: DataListener) {
        self.data_listeners.write().insert(session_id, listener);
    }

    /// Forget a session in either role
    pub fn close_session(&self, session_id: Uuid) {
        self.sessions.write().remove(&session_id);
        self.pending.lock().remove(&session_id);
        self.control_listeners.write().remove(&session_id);
        self.data_listeners.write().remove(&session_id);
    }

    pub fn session(&self, session_id: Uuid) -> Option<RelaySession> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// Send a control message to the far endpoint through `relay_peer`
    pub fn send_control(&self, relay_peer: &str, session_id: Uuid, message: &str) -> Result<(), RelayError> {
        self.sender.send_text(
            relay_peer,
            StreamLabel::Chat,
            &format_control(session_id, message),
        )?;
        Ok(())
    }

    /// Send opaque bytes to the far endpoint through `relay_peer`
    pub fn send_data(&self, relay_peer: &str, session_id: Uuid, payload: &[u8]) -> Result<(), RelayError> {
        self.sender
            .send_binary(relay_peer, StreamLabel::Relay, &pack(session_id, payload))?;
        Ok(())
    }

    /// Handle `RELAY_CTRL:` text from the chat stream
    pub fn handle_control(&self, from: &str, text: &str) {
        let Some((session_id, message)) = parse_control(text) else {
            debug!("Malformed relay control from {}", short_id(from));
            return;
        };
        if let Some(session) = self.session(session_id) {
            self.forward(&session, from, StreamLabel::Chat, Forward::Text(text));
            return;
        }
        let listener = self.control_listeners.read().get(&session_id).cloned();
        match listener {
            Some(listener) => listener(from, message),
            None => debug!("No control listener for relay session {}", session_id),
        }
    }

    /// Handle a binary packet from the relay stream
    pub fn handle_data(&self, from: &str, packet: &[u8]) {
        let Some((session_id, payload)) = unpack(packet) else {
            debug!("Dropping short relay packet ({} bytes) from {}", packet.len(), short_id(from));
            return;
        };
        if let Some(session) = self.session(session_id) {
            self.forward(&session, from, StreamLabel::Relay, Forward::Binary(packet));
            return;
        }
        let listener = self.data_listeners.read().get(&session_id).cloned();
        match listener {
            Some(listener) => listener(from, payload),
            None => debug!("No data listener for relay session {}", session_id),
        }
    }

    fn forward(&self, session: &RelaySession, from: &str, label: StreamLabel, item: Forward<'_>) {
        let Some(dest) = session.other_side(from) else {
            debug!(
                "{} is not a party to relay session {}",
                short_id(from),
                session.id
            );
            return;
        };

        if self.sender.is_connected(dest, label) {
            let sent = match item {
                Forward::Text(text) => self.sender.send_text(dest, label, text),
                Forward::Binary(bytes) => self.sender.send_binary(dest, label, bytes),
            };
            match sent {
                Ok(()) => return,
                Err(e) => debug!("Relay forward to {} failed: {}", short_id(dest), e),
            }
        }

        let bytes = match item {
            Forward::Text(text) => text.as_bytes(),
            Forward::Binary(bytes) => bytes,
        };
        if self.offline.store_relay_message(dest, from, bytes) {
            debug!("Held relay traffic for offline peer {}", short_id(dest));
        } else {
            debug!("Dropped relay traffic for {}", short_id(dest));
        }
    }
}

#[derive(Clone, Copy)]
enum Forward<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{OfflineConfig, OfflineStore};
    use crate::store::MemoryStorage;
    use crate::testing::RecordingSender;
    use crate::trust::MemoryTrustDirectory;

    struct Fixture {
        sender: Arc<RecordingSender>,
        trust: Arc<MemoryTrustDirectory>,
        offline: Arc<OfflineManager>,
        relay: RelayCoordinator,
    }

    fn fixture(id: &str) -> Fixture {
        let sender = Arc::new(RecordingSender::new());
        let trust = Arc::new(MemoryTrustDirectory::new());
        let offline = Arc::new(OfflineManager::new(
            id,
            OfflineConfig::default(),
            sender.clone(),
            OfflineStore::new(Arc::new(MemoryStorage::new())),
            trust.clone(),
        ));
        let relay = RelayCoordinator::new(id, sender.clone(), offline.clone());
        Fixture {
            sender,
            trust,
            offline,
            relay,
        }
    }

    fn discovery(sender: &RecordingSender, peer: &str) -> Vec<DiscoveryMessage> {
        sender
            .texts_to(peer, StreamLabel::Discovery)
            .iter()
            .map(|json| DiscoveryMessage::from_json(json).unwrap())
            .collect()
    }

    #[test]
    fn test_relay_setup_handshake() {
        let alice = fixture("alice");
        alice.sender.connect("bob");
        let ready = Arc::new(Mutex::new(None));
        let slot = ready.clone();
        let session_id = alice
            .relay
            .request_relay("bob", "carol", Box::new(move |id| *slot.lock() = Some(id)))
            .unwrap();

        let sent = discovery(&alice.sender, "bob");
        assert_eq!(sent[0].kind, DiscoveryKind::RelayRequest);
        assert_eq!(sent[0].payload, format!("RELAY_REQUEST:carol:{}", session_id));

        let bob = fixture("bob");
        bob.sender.connect("alice");
        bob.relay.handle_discovery("alice", &sent[0]);
        assert_eq!(
            bob.relay.session(session_id),
            Some(RelaySession {
                id: session_id,
                peer_a: "alice".into(),
                peer_c: "carol".into(),
            })
        );

        let reply = discovery(&bob.sender, "alice");
        assert_eq!(reply[0].kind, DiscoveryKind::RelayReady);

        // A ready from the wrong peer is ignored
        alice.relay.handle_discovery("mallory", &reply[0]);
        assert_eq!(*ready.lock(), None);
        alice.relay.handle_discovery("bob", &reply[0]);
        assert_eq!(*ready.lock(), Some(session_id));
    }

    #[test]
    fn test_request_without_channel_fails() {
        let alice = fixture("alice");
        assert!(alice
            .relay
            .request_relay("bob", "carol", Box::new(|_| {}))
            .is_err());
    }

    #[test]
    fn test_intermediary_forwards_both_directions() {
        let bob = fixture("bob");
        bob.sender.connect("alice");
        bob.sender.connect("carol");
        let id = Uuid::new_v4();
        bob.relay
            .handle_relay_request("alice", &format_relay_request("carol", id));

        let ctrl = format_control(id, "OFFER:sdp");
        bob.relay.handle_control("alice", &ctrl);
        assert_eq!(bob.sender.texts_to("carol", StreamLabel::Chat), vec![ctrl]);

        let packet = pack(id, b"bytes");
        bob.relay.handle_data("carol", &packet);
        assert_eq!(bob.sender.binaries_to("alice", StreamLabel::Relay), vec![packet]);

        // Outsiders cannot inject into the session
        bob.relay.handle_data("mallory", &pack(id, b"spoof"));
        assert_eq!(bob.sender.binaries_to("carol", StreamLabel::Relay).len(), 0);
    }

    #[test]
    fn test_known_session_id_is_never_re_recorded() {
        let bob = fixture("bob");
        bob.sender.connect("alice");
        bob.sender.connect("carol");
        bob.sender.connect("mallory");
        let id = Uuid::new_v4();
        bob.relay
            .handle_relay_request("alice", &format_relay_request("carol", id));
        bob.relay
            .handle_relay_request("mallory", &format_relay_request("alice", id));

        let session = bob.relay.session(id).unwrap();
        assert_eq!(
            (session.peer_a.as_str(), session.peer_c.as_str()),
            ("alice", "carol")
        );
        assert!(discovery(&bob.sender, "mallory").is_empty());

        let ctrl = format_control(id, "secret");
        bob.relay.handle_control("alice", &ctrl);
        assert_eq!(bob.sender.texts_to("carol", StreamLabel::Chat), vec![ctrl]);
        assert!(bob.sender.texts_to("mallory", StreamLabel::Chat).is_empty());
    }

    #[test]
    fn test_intermediary_falls_back_to_offline_store() {
        let bob = fixture("bob");
        bob.sender.connect("alice");
        let id = Uuid::new_v4();
        bob.relay
            .handle_relay_request("alice", &format_relay_request("carol", id));

        // carol is offline and not trusted enough
        bob.relay.handle_control("alice", &format_control(id, "one"));
        assert_eq!(bob.offline.store_handle().count("carol").unwrap(), 0);

        bob.trust.set_level("carol", 4);
        bob.relay.handle_control("alice", &format_control(id, "two"));
        let held = bob.offline.store_handle().retrieve("carol", 0).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].sender, "alice");
    }

    #[test]
    fn test_endpoint_delivers_to_listeners() {
        let carol = fixture("carol");
        let id = Uuid::new_v4();
        let controls = Arc::new(Mutex::new(Vec::new()));
        let data = Arc::new(Mutex::new(Vec::new()));
        let (c, d) = (controls.clone(), data.clone());
        carol.relay.register_control_listener(
            id,
            Arc::new(move |from: &str, msg: &str| c.lock().push((from.to_string(), msg.to_string()))),
        );
        carol.relay.register_data_listener(
            id,
            Arc::new(move |from: &str, payload: &[u8]| d.lock().push((from.to_string(), payload.to_vec()))),
        );

        carol.relay.handle_control("bob", &format_control(id, "ANSWER:x"));
        carol.relay.handle_data("bob", &pack(id, b"payload"));
        carol.relay.handle_data("bob", &[1, 2, 3]);

        assert_eq!(
            controls.lock().as_slice(),
            [("bob".to_string(), "ANSWER:x".to_string())]
        );
        assert_eq!(data.lock().as_slice(), [("bob".to_string(), b"payload".to_vec())]);

        carol.relay.close_session(id);
        carol.relay.handle_data("bob", &pack(id, b"late"));
        assert_eq!(data.lock().len(), 1);
    }

    #[test]
    fn test_endpoint_send_helpers() {
        let alice = fixture("alice");
        alice.sender.connect("bob");
        let id = Uuid::new_v4();
        alice.relay.send_control("bob", id, "hello").unwrap();
        alice.relay.send_data("bob", id, b"abc").unwrap();

        assert_eq!(
            alice.sender.texts_to("bob", StreamLabel::Chat),
            vec![format!("RELAY_CTRL:{}:hello", id)]
        );
        let packets = alice.sender.binaries_to("bob", StreamLabel::Relay);
        assert_eq!(unpack(&packets[0]), Some((id, &b"abc"[..])));
    }
}
