//! Peer connection engine seam
//!
//! NAT traversal and the negotiated transport belong to an external engine
//! (WebRTC on mobile). The core drives it through these traits and consumes
//! its callbacks as [`EngineEvent`]s tagged with the peer id and the
//! connection generation, so events from a disposed connection can be
//! recognised and ignored.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryEngine, MemoryNetwork};
pub use tcp::TcpEngine;

use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Connection closed")]
    Closed,
    #[error("Channel not open: {0}")]
    ChannelNotOpen(String),
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),
    #[error("Remote description not set")]
    NoRemoteDescription,
    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity state reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceState::New => "new",
            IceState::Checking => "checking",
            IceState::Connected => "connected",
            IceState::Completed => "completed",
            IceState::Disconnected => "disconnected",
            IceState::Failed => "failed",
            IceState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Vec<u8>),
}

pub enum EngineEvent {
    IceCandidate(IceCandidate),
    StateChanged(IceState),
    /// A channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen(String),
    Message {
        label: String,
        payload: ChannelPayload,
    },
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            EngineEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            EngineEvent::ChannelOpen(l) => f.debug_tuple("ChannelOpen").field(l).finish(),
            EngineEvent::Message { label, .. } => {
                f.debug_struct("Message").field("label", label).finish()
            }
        }
    }
}

#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: EngineEvent,
}

/// Where an engine connection reports its callbacks
#[derive(Clone)]
pub struct EventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventSink {
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One labelled, ordered, reliable channel inside a peer connection
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    fn send_text(&self, text: &str) -> Result<(), EngineError>;
    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError>;
    /// Bytes queued locally and not yet handed to the network
    fn buffered_amount(&self) -> u64;
    fn close(&self);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError>;
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    fn has_remote_description(&self) -> bool;
    fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, peer_id: &str, events: EventSink)
        -> Result<Arc<dyn PeerConnection>, EngineError>;
}
