// Connection module: pairing requests and the per-peer connection lifecycle

pub mod orchestrator;
pub mod requests;

pub use orchestrator::{ConnectionOrchestrator, OrchestratorConfig, PeerInfo};
pub use requests::{ConnectionRequestRegistry, ConnectionRequestState};

use crate::engine::{ChannelPayload, DataChannel, EngineError};
use crate::signaling::SignalingError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Peer {0} has not completed pairing")]
    NotApproved(String),
    #[error("Cannot connect to ourselves")]
    SelfConnection,
    #[error("Orchestrator is shut down")]
    Shutdown,
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// Lifecycle of the negotiated connection to one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Consumer of per-peer channel traffic and lifecycle changes.
///
/// Callbacks run on the orchestrator's event loop and must not block.
pub trait ConnectionObserver: Send + Sync {
    /// A data channel now exists for `peer_id`. `is_initiator` is true when
    /// this side created it.
    fn on_channel(&self, peer_id: &str, channel: Arc<dyn DataChannel>, is_initiator: bool);
    fn on_channel_open(&self, peer_id: &str, label: &str);
    fn on_message(&self, peer_id: &str, label: &str, payload: ChannelPayload);
    fn on_state(&self, _peer_id: &str, _state: ConnectionState) {}
    /// Every channel to `peer_id` is gone; later sends must fail
    fn on_closed(&self, peer_id: &str);
}
