// In-process engine: connections rendezvous through a shared MemoryNetwork
//
// The SDP is just `memory:<token>`. Applying the answer on the offering side
// links both connections: the answerer learns the offerer's channels, both
// sides report Connected and every channel opens.

use super::{
    ChannelPayload, DataChannel, EngineError, EngineEvent, EventSink, IceState, PeerConnection,
    PeerConnectionFactory, SdpKind, SessionDescription,
};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

const SDP_PREFIX: &str = "memory:";

/// Rendezvous table shared by every engine in the process
#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<String, Weak<MemoryPeerConnection>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, token: &str, connection: Weak<MemoryPeerConnection>) {
        self.endpoints.write().insert(token.to_string(), connection);
    }

    fn unregister(&self, token: &str) {
        self.endpoints.write().remove(token);
    }

    fn lookup(&self, token: &str) -> Option<Arc<MemoryPeerConnection>> {
        self.endpoints.read().get(token).and_then(Weak::upgrade)
    }
}

pub struct MemoryEngine {
    network: Arc<MemoryNetwork>,
    connections: RwLock<HashMap<String, Arc<MemoryPeerConnection>>>,
}

impl MemoryEngine {
    pub fn new(network: Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Most recent connection created for `peer_id`
    pub fn connection(&self, peer_id: &str) -> Option<Arc<MemoryPeerConnection>> {
        self.connections.read().get(peer_id).cloned()
    }
}

impl PeerConnectionFactory for MemoryEngine {
    fn create(
        &self,
        peer_id: &str,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let token = Uuid::new_v4().to_string();
        let connection = Arc::new_cyclic(|weak| MemoryPeerConnection {
            token: token.clone(),
            self_ref: weak.clone(),
            events,
            network: self.network.clone(),
            channels: Mutex::new(HashMap::new()),
            remote: Mutex::new(None),
            remote_description: Mutex::new(None),
            closed: AtomicBool::new(false),
            candidates_added: AtomicUsize::new(0),
        });
        self.network.register(&token, Arc::downgrade(&connection));
        self.connections
            .write()
            .insert(peer_id.to_string(), connection.clone());
        Ok(connection)
    }
}

pub struct MemoryPeerConnection {
    token: String,
    self_ref: Weak<MemoryPeerConnection>,
    events: EventSink,
    network: Arc<MemoryNetwork>,
    channels: Mutex<HashMap<String, Arc<MemoryDataChannel>>>,
    remote: Mutex<Option<Weak<MemoryPeerConnection>>>,
    remote_description: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
    candidates_added: AtomicUsize,
}

impl MemoryPeerConnection {
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryDataChannel>> {
        self.channels.lock().get(label).cloned()
    }

    pub fn candidates_added(&self) -> usize {
        self.candidates_added.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Break the link without closing either side, as a network loss would
    pub fn drop_link(&self) {
        let remote = self.remote.lock().take().and_then(|w| w.upgrade());
        self.lose_link();
        if let Some(remote) = remote {
            remote.remote.lock().take();
            remote.lose_link();
        }
    }

    fn lose_link(&self) {
        for channel in self.channels.lock().values() {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.events.emit(EngineEvent::StateChanged(IceState::Disconnected));
    }

    fn link_with(&self, answerer: &Arc<MemoryPeerConnection>) {
        let offered: Vec<Arc<MemoryDataChannel>> = self.channels.lock().values().cloned().collect();

        for local in offered {
            let remote = Arc::new(MemoryDataChannel::new(&local.label));
            *remote.remote_events.lock() = Some(self.events.clone());
            *local.remote_events.lock() = Some(answerer.events.clone());
            local.open.store(true, Ordering::SeqCst);
            remote.open.store(true, Ordering::SeqCst);
            answerer
                .channels
                .lock()
                .insert(local.label.clone(), remote.clone());
            answerer.events.emit(EngineEvent::DataChannel(remote));
        }

        self.events.emit(EngineEvent::StateChanged(IceState::Connected));
        answerer
            .events
            .emit(EngineEvent::StateChanged(IceState::Connected));

        let labels: Vec<String> = self.channels.lock().keys().cloned().collect();
        for label in labels {
            self.events.emit(EngineEvent::ChannelOpen(label.clone()));
            answerer.events.emit(EngineEvent::ChannelOpen(label));
        }
    }
}

fn parse_token(desc: &SessionDescription) -> Result<&str, EngineError> {
    desc.sdp
        .strip_prefix(SDP_PREFIX)
        .ok_or_else(|| EngineError::InvalidDescription(desc.sdp.clone()))
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let channel = Arc::new(MemoryDataChannel::new(label));
        self.channels
            .lock()
            .insert(label.to_string(), channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.token)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if !self.has_remote_description() {
            return Err(EngineError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.token)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.events.emit(EngineEvent::IceCandidate(IceCandidate {
            sdp: format!("candidate:memory {} typ host", self.token),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: 0,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let token = parse_token(&desc)?;
        let remote = self
            .network
            .lookup(token)
            .ok_or_else(|| EngineError::InvalidDescription(desc.sdp.clone()))?;

        *self.remote.lock() = Some(Arc::downgrade(&remote));
        let kind = desc.kind;
        *self.remote_description.lock() = Some(desc);

        if kind == SdpKind::Answer {
            *remote.remote.lock() = Some(self.self_ref.clone());
            self.link_with(&remote);
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
        if !self.has_remote_description() {
            return Err(EngineError::NoRemoteDescription);
        }
        self.candidates_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(&self.token);
        for channel in self.channels.lock().values() {
            channel.open.store(false, Ordering::SeqCst);
        }
        let remote = self.remote.lock().take().and_then(|w| w.upgrade());
        if let Some(remote) = remote {
            remote.remote.lock().take();
            remote.lose_link();
        }
        self.events.emit(EngineEvent::StateChanged(IceState::Closed));
    }
}

pub struct MemoryDataChannel {
    label: String,
    open: AtomicBool,
    remote_events: Mutex<Option<EventSink>>,
    buffered: AtomicU64,
}

impl MemoryDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            remote_events: Mutex::new(None),
            buffered: AtomicU64::new(0),
        }
    }

    /// Pretend `bytes` are still queued locally
    pub fn set_buffered_amount(&self, bytes: u64) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    fn deliver(&self, payload: ChannelPayload) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::ChannelNotOpen(self.label.clone()));
        }
        let sink = self
            .remote_events
            .lock()
            .clone()
            .ok_or_else(|| EngineError::ChannelNotOpen(self.label.clone()))?;
        sink.emit(EngineEvent::Message {
            label: self.label.clone(),
            payload,
        });
        Ok(())
    }
}

impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.deliver(ChannelPayload::Text(text.to_string()))
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError> {
        self.deliver(ChannelPayload::Binary(data.to_vec()))
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
