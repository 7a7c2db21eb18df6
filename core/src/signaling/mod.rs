//! Signaling transports
//!
//! Moves connection-setup envelopes (offers, answers, ICE candidates and the
//! pairing request/accept pair) between peer identifiers before any direct
//! channel exists. Every backend serializes the same [`SignalingEnvelope`]
//! so they can be swapped or aggregated freely.

pub mod composite;
pub mod http;
pub mod local;
pub mod loopback;
pub mod websocket;

pub use composite::CompositeSignaling;
pub use http::HttpSignaling;
pub use local::{LocalSignaling, ServiceDiscovery, StaticDiscovery, SERVICE_PREFIX};
pub use loopback::{LoopbackHub, LoopbackSignaling};
pub use websocket::WebSocketSignaling;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SignalingError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kind of signaling envelope, serialized as the upper-case wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    ConnectRequest,
    ConnectAccept,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "OFFER"),
            SignalKind::Answer => write!(f, "ANSWER"),
            SignalKind::Candidate => write!(f, "CANDIDATE"),
            SignalKind::ConnectRequest => write!(f, "CONNECT_REQUEST"),
            SignalKind::ConnectAccept => write!(f, "CONNECT_ACCEPT"),
        }
    }
}

/// Transport-independent signaling envelope: `{from, to, type, data}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub from: String,
    /// Polling inboxes omit the recipient; it is implied by the mailbox
    #[serde(default)]
    pub to: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// SDP text for offers/answers, candidate JSON for candidates, empty otherwise
    #[serde(default)]
    pub data: String,
}

impl SignalingEnvelope {
    pub fn new(from: &str, to: &str, kind: SignalKind, data: String) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Serialization(e.to_string()))
    }
}

/// ICE candidate as carried in a `CANDIDATE` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub sdp: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u32,
}

impl IceCandidate {
    pub fn to_data(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Serialization(e.to_string()))
    }

    pub fn from_data(data: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(data).map_err(|e| SignalingError::Serialization(e.to_string()))
    }
}

pub type SignalListener = Arc<dyn Fn(SignalingEnvelope) + Send + Sync>;

/// A signaling backend.
///
/// Delivery is best-effort: duplicates and reordering are possible and are
/// handled by the consumers, not here.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError>;

    fn set_listener(&self, listener: SignalListener);

    async fn shutdown(&self);
}

/// Listener slot shared by the backends
#[derive(Clone, Default)]
pub(crate) struct ListenerSlot {
    inner: Arc<RwLock<Option<SignalListener>>>,
}

impl ListenerSlot {
    pub(crate) fn set(&self, listener: SignalListener) {
        *self.inner.write() = Some(listener);
    }

    /// Hand an inbound envelope to the listener if it is addressed to `local_id`
    pub(crate) fn deliver(&self, local_id: &str, envelope: SignalingEnvelope) {
        if envelope.to != local_id {
            tracing::debug!(
                "Dropping envelope for {} (we are {})",
                short_id(&envelope.to),
                short_id(local_id)
            );
            return;
        }
        let listener = self.inner.read().clone();
        if let Some(listener) = listener {
            listener(envelope);
        }
    }
}

/// First 8 characters of a peer id, for log lines
pub fn short_id(peer_id: &str) -> &str {
    match peer_id.char_indices().nth(8) {
        Some((idx, _)) => &peer_id[..idx],
        None => peer_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let env = SignalingEnvelope::new("alice", "bob", SignalKind::ConnectRequest, String::new());
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();

        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["type"], "CONNECT_REQUEST");
        assert_eq!(json["data"], "");
    }

    #[test]
    fn test_envelope_missing_data_defaults_empty() {
        let env =
            SignalingEnvelope::from_json(r#"{"from":"a","to":"b","type":"CONNECT_ACCEPT"}"#).unwrap();
        assert_eq!(env.kind, SignalKind::ConnectAccept);
        assert!(env.data.is_empty());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(SignalingEnvelope::from_json(r#"{"from":"a","to":"b","type":"PING","data":""}"#)
            .is_err());
    }

    #[test]
    fn test_candidate_field_names() {
        let candidate = IceCandidate {
            sdp: "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: 0,
        };
        let json: serde_json::Value = serde_json::from_str(&candidate.to_data().unwrap()).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(IceCandidate::from_data(&candidate.to_data().unwrap()).unwrap(), candidate);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
