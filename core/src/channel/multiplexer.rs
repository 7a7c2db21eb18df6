// Stream multiplexer: one secure channel per (peer, label)

use super::{ChannelError, SecureChannel};
use crate::connection::{ConnectionObserver, ConnectionState};
use crate::engine::{ChannelPayload, DataChannel};
use crate::signaling::short_id;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Binary sends are refused while more than this is queued on the channel
pub const DEFAULT_BUFFER_THRESHOLD: u64 = 1024 * 1024;

/// Logical streams multiplexed over one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamLabel {
    Chat,
    File,
    Discovery,
    OfflineMsg,
    Relay,
}

impl StreamLabel {
    pub const ALL: [StreamLabel; 5] = [
        StreamLabel::Chat,
        StreamLabel::File,
        StreamLabel::Discovery,
        StreamLabel::OfflineMsg,
        StreamLabel::Relay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamLabel::Chat => "chat",
            StreamLabel::File => "file",
            StreamLabel::Discovery => "discovery",
            StreamLabel::OfflineMsg => "offline_msg",
            StreamLabel::Relay => "relay",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == label)
    }
}

impl fmt::Display for StreamLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    #[error("No {label} channel to peer {peer}")]
    NoChannel { peer: String, label: StreamLabel },
    #[error("Send buffer full ({buffered} bytes queued)")]
    Backpressure { buffered: u64 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Outbound side of the multiplexer as the stream protocols see it
pub trait StreamSender: Send + Sync {
    fn send_text(&self, peer_id: &str, label: StreamLabel, text: &str) -> Result<(), MuxError>;
    fn send_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) -> Result<(), MuxError>;
    fn is_connected(&self, peer_id: &str, label: StreamLabel) -> bool;
    fn connected_peers(&self, label: StreamLabel) -> Vec<String>;

    /// Send `text` on `label` to every connected peer except `exclude`.
    /// Returns how many peers accepted it.
    fn broadcast_text(&self, label: StreamLabel, text: &str, exclude: Option<&str>) -> usize {
        self.connected_peers(label)
            .into_iter()
            .filter(|peer| Some(peer.as_str()) != exclude)
            .filter(|peer| match self.send_text(peer, label, text) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Broadcast to {} failed: {}", short_id(peer), e);
                    false
                }
            })
            .count()
    }
}

/// Receives decrypted application payloads
pub trait ChannelListener: Send + Sync {
    fn on_text(&self, _peer_id: &str, _label: StreamLabel, _text: &str) {}
    fn on_binary(&self, _peer_id: &str, _label: StreamLabel, _data: &[u8]) {}
    fn on_peer_ready(&self, _peer_id: &str) {}
    fn on_peer_closed(&self, _peer_id: &str) {}
}

pub struct ChannelMultiplexer {
    channels: RwLock<HashMap<(String, StreamLabel), Arc<SecureChannel>>>,
    listeners: RwLock<Vec<Arc<dyn ChannelListener>>>,
    buffer_threshold: u64,
}

impl Default for ChannelMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_THRESHOLD)
    }
}

impl ChannelMultiplexer {
    pub fn new(buffer_threshold: u64) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            buffer_threshold,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.listeners.write().push(listener);
    }

    pub fn send_text(&self, peer_id: &str, label: StreamLabel, text: &str) -> Result<(), MuxError> {
        let channel = self.channel(peer_id, label)?;
        channel.send_text(text)?;
        Ok(())
    }

    pub fn send_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) -> Result<(), MuxError> {
        let channel = self.channel(peer_id, label)?;
        let buffered = channel.buffered_amount();
        if buffered > self.buffer_threshold {
            return Err(MuxError::Backpressure { buffered });
        }
        channel.send_binary(data)?;
        Ok(())
    }

    pub fn is_connected(&self, peer_id: &str, label: StreamLabel) -> bool {
        self.channels
            .read()
            .get(&(peer_id.to_string(), label))
            .map(|ch| !ch.is_closed())
            .unwrap_or(false)
    }

    /// Whether the secure session on `label` has completed its handshake
    pub fn is_ready(&self, peer_id: &str, label: StreamLabel) -> bool {
        self.channels
            .read()
            .get(&(peer_id.to_string(), label))
            .map(|ch| ch.is_ready())
            .unwrap_or(false)
    }

    pub fn connected_peers(&self, label: StreamLabel) -> Vec<String> {
        let mut peers: Vec<String> = self
            .channels
            .read()
            .iter()
            .filter(|((_, l), ch)| *l == label && !ch.is_closed())
            .map(|((peer, _), _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    fn channel(&self, peer_id: &str, label: StreamLabel) -> Result<Arc<SecureChannel>, MuxError> {
        self.channels
            .read()
            .get(&(peer_id.to_string(), label))
            .filter(|ch| !ch.is_closed())
            .cloned()
            .ok_or_else(|| MuxError::NoChannel {
                peer: peer_id.to_string(),
                label,
            })
    }

    fn listeners(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.listeners.read().clone()
    }
}

impl StreamSender for ChannelMultiplexer {
    fn send_text(&self, peer_id: &str, label: StreamLabel, text: &str) -> Result<(), MuxError> {
        ChannelMultiplexer::send_text(self, peer_id, label, text)
    }

    fn send_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) -> Result<(), MuxError> {
        ChannelMultiplexer::send_binary(self, peer_id, label, data)
    }

    fn is_connected(&self, peer_id: &str, label: StreamLabel) -> bool {
        ChannelMultiplexer::is_connected(self, peer_id, label)
    }

    fn connected_peers(&self, label: StreamLabel) -> Vec<String> {
        ChannelMultiplexer::connected_peers(self, label)
    }
}

impl ConnectionObserver for ChannelMultiplexer {
    fn on_channel(&self, peer_id: &str, channel: Arc<dyn DataChannel>, is_initiator: bool) {
        let Some(label) = StreamLabel::from_label(channel.label()) else {
            warn!("Ignoring channel with unknown label {:?} from {}", channel.label(), short_id(peer_id));
            return;
        };
        let secure = Arc::new(SecureChannel::new(channel, is_initiator));
        let previous = self
            .channels
            .write()
            .insert((peer_id.to_string(), label), secure);
        if let Some(old) = previous {
            old.close();
        }
    }

    fn on_channel_open(&self, peer_id: &str, label: &str) {
        let Some(label) = StreamLabel::from_label(label) else {
            return;
        };
        let channel = self
            .channels
            .read()
            .get(&(peer_id.to_string(), label))
            .cloned();
        if let Some(channel) = channel {
            channel.on_open();
        }
    }

    fn on_message(&self, peer_id: &str, label: &str, payload: ChannelPayload) {
        let Some(stream) = StreamLabel::from_label(label) else {
            return;
        };
        let Some(channel) = self
            .channels
            .read()
            .get(&(peer_id.to_string(), stream))
            .cloned()
        else {
            debug!("Message on unknown channel {} from {}", label, short_id(peer_id));
            return;
        };

        let was_ready = channel.is_ready();
        match payload {
            ChannelPayload::Text(frame) => {
                if let Some(text) = channel.handle_text(&frame) {
                    for listener in self.listeners() {
                        listener.on_text(peer_id, stream, &text);
                    }
                }
            }
            ChannelPayload::Binary(data) => {
                if let Some(plain) = channel.handle_binary(&data) {
                    for listener in self.listeners() {
                        listener.on_binary(peer_id, stream, &plain);
                    }
                }
            }
        }

        // The chat stream finishing its handshake marks the peer usable
        if !was_ready && channel.is_ready() && stream == StreamLabel::Chat {
            for listener in self.listeners() {
                listener.on_peer_ready(peer_id);
            }
        }
    }

    fn on_state(&self, peer_id: &str, state: ConnectionState) {
        debug!("Peer {} is {:?}", short_id(peer_id), state);
    }

    fn on_closed(&self, peer_id: &str) {
        let removed: Vec<Arc<SecureChannel>> = {
            let mut channels = self.channels.write();
            let keys: Vec<_> = channels
                .keys()
                .filter(|(peer, _)| peer == peer_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| channels.remove(k)).collect()
        };
        if removed.is_empty() {
            return;
        }
        for channel in removed {
            channel.close();
        }
        for listener in self.listeners() {
            listener.on_peer_closed(peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineEvent, EventSink, MemoryEngine, MemoryNetwork};
    use crate::engine::{PeerConnection, PeerConnectionFactory, PeerEvent};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Collector {
        texts: Mutex<Vec<(String, StreamLabel, String)>>,
        binaries: Mutex<Vec<(String, StreamLabel, Vec<u8>)>>,
        ready: Mutex<Vec<String>>,
    }

    impl ChannelListener for Collector {
        fn on_text(&self, peer_id: &str, label: StreamLabel, text: &str) {
            self.texts
                .lock()
                .push((peer_id.to_string(), label, text.to_string()));
        }
        fn on_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) {
            self.binaries
                .lock()
                .push((peer_id.to_string(), label, data.to_vec()));
        }
        fn on_peer_ready(&self, peer_id: &str) {
            self.ready.lock().push(peer_id.to_string());
        }
    }

    /// Feed engine events into a multiplexer the way the orchestrator does
    fn dispatch(mux: &ChannelMultiplexer, event: PeerEvent, is_initiator: bool) {
        match event.event {
            EngineEvent::DataChannel(ch) => mux.on_channel(&event.peer_id, ch, is_initiator),
            EngineEvent::ChannelOpen(label) => mux.on_channel_open(&event.peer_id, &label),
            EngineEvent::Message { label, payload } => mux.on_message(&event.peer_id, &label, payload),
            _ => {}
        }
    }

    struct Pair {
        mux_a: ChannelMultiplexer,
        col_a: Arc<Collector>,
        rx_a: mpsc::UnboundedReceiver<PeerEvent>,
        mux_b: ChannelMultiplexer,
        col_b: Arc<Collector>,
        rx_b: mpsc::UnboundedReceiver<PeerEvent>,
    }

    impl Pair {
        /// Deliver queued engine events until both sides go quiet
        fn settle(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(ev) = self.rx_a.try_recv() {
                    dispatch(&self.mux_a, ev, true);
                    progressed = true;
                }
                while let Ok(ev) = self.rx_b.try_recv() {
                    dispatch(&self.mux_b, ev, false);
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }
    }

    async fn linked_pair() -> Result<Pair, EngineError> {
        let network = MemoryNetwork::new();
        let engine_a = MemoryEngine::new(network.clone());
        let engine_b = MemoryEngine::new(network);
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let pc_a = engine_a.create("bob", EventSink::new("bob", 1, tx_a))?;
        let pc_b = engine_b.create("alice", EventSink::new("alice", 1, tx_b))?;

        let mut pair = Pair {
            mux_a: ChannelMultiplexer::default(),
            col_a: Arc::new(Collector::default()),
            rx_a,
            mux_b: ChannelMultiplexer::default(),
            col_b: Arc::new(Collector::default()),
            rx_b,
        };
        pair.mux_a.add_listener(pair.col_a.clone());
        pair.mux_b.add_listener(pair.col_b.clone());

        for label in [StreamLabel::Chat, StreamLabel::File] {
            let ch = pc_a.create_data_channel(label.as_str())?;
            pair.mux_a.on_channel("bob", ch, true);
        }

        let offer = pc_a.create_offer().await?;
        pc_a.set_local_description(offer.clone()).await?;
        pc_b.set_remote_description(offer).await?;
        let answer = pc_b.create_answer().await?;
        pc_b.set_local_description(answer.clone()).await?;
        pc_a.set_remote_description(answer).await?;

        pair.settle();
        Ok(pair)
    }

    #[test]
    fn test_label_names() {
        assert_eq!(StreamLabel::OfflineMsg.as_str(), "offline_msg");
        assert_eq!(StreamLabel::from_label("discovery"), Some(StreamLabel::Discovery));
        assert_eq!(StreamLabel::from_label("video"), None);
    }

    #[tokio::test]
    async fn test_channels_handshake_and_mark_peer_ready() {
        let pair = linked_pair().await.unwrap();
        assert!(pair.mux_a.is_ready("bob", StreamLabel::Chat));
        assert!(pair.mux_b.is_ready("alice", StreamLabel::Chat));
        assert!(pair.mux_b.is_ready("alice", StreamLabel::File));
        assert_eq!(pair.col_a.ready.lock().as_slice(), ["bob".to_string()]);
        assert_eq!(pair.col_b.ready.lock().as_slice(), ["alice".to_string()]);
        assert_eq!(
            pair.mux_a.connected_peers(StreamLabel::Chat),
            vec!["bob".to_string()]
        );
    }

    #[tokio::test]
    async fn test_payloads_reach_listeners_by_label() {
        let mut pair = linked_pair().await.unwrap();
        pair.mux_a
            .send_text("bob", StreamLabel::Chat, "hello bob")
            .unwrap();
        pair.mux_b
            .send_binary("alice", StreamLabel::File, &[1, 2, 3])
            .unwrap();
        pair.settle();

        let texts = pair.col_b.texts.lock().clone();
        assert_eq!(
            texts,
            vec![("alice".to_string(), StreamLabel::Chat, "hello bob".to_string())]
        );
        let binaries = pair.col_a.binaries.lock().clone();
        assert_eq!(
            binaries,
            vec![("bob".to_string(), StreamLabel::File, vec![1, 2, 3])]
        );
    }

    #[tokio::test]
    async fn test_send_without_channel_fails_fast() {
        let mux = ChannelMultiplexer::default();
        let err = mux.send_text("nobody", StreamLabel::Chat, "hi").unwrap_err();
        assert!(matches!(err, MuxError::NoChannel { label: StreamLabel::Chat, .. }));
        assert_eq!(mux.broadcast_text(StreamLabel::Chat, "hi", None), 0);
    }

    #[tokio::test]
    async fn test_closed_peer_drops_channels() {
        let pair = linked_pair().await.unwrap();
        pair.mux_a.on_closed("bob");
        assert!(!pair.mux_a.is_connected("bob", StreamLabel::Chat));
        assert!(pair.mux_a.send_text("bob", StreamLabel::Chat, "late").is_err());
    }

    #[tokio::test]
    async fn test_binary_backpressure() {
        let network = MemoryNetwork::new();
        let engine = MemoryEngine::new(network);
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine.create("bob", EventSink::new("bob", 1, tx)).unwrap();
        let ch = pc.create_data_channel("file").unwrap();

        let mux = ChannelMultiplexer::new(1024);
        mux.on_channel("bob", ch, true);
        let memory_pc = engine.connection("bob").unwrap();
        memory_pc.channel("file").unwrap().set_buffered_amount(4096);

        let err = mux.send_binary("bob", StreamLabel::File, &[1, 2, 3]).unwrap_err();
        assert_eq!(err, MuxError::Backpressure { buffered: 4096 });
    }
}
