// Ananta Core: peer-to-peer substrate
//
// Pairing, signaling, forward-secret channels multiplexed per peer, relaying
// through a third peer, store-and-forward for absent peers, gossip search
// and file transfer. `Node` wires them together; every component can also be
// constructed on its own.

pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod identity;
pub mod node;
pub mod offline;
pub mod relay;
pub mod search;
pub mod signaling;
pub mod store;
pub mod transfer;
pub mod trust;

#[cfg(test)]
mod testing;

use thiserror::Error;

pub use channel::{ChannelMultiplexer, SecureChannel, StreamLabel, StreamSender};
pub use config::NodeConfig;
pub use connection::{ConnectionOrchestrator, ConnectionRequestRegistry, ConnectionState};
pub use crypto::RatchetSession;
pub use identity::{IdentityKeys, IdentityManager};
pub use node::{ChatListener, Node, NodeBuilder};
pub use signaling::{short_id, SignalKind, SignalingEnvelope, SignalingTransport};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Signaling error: {0}")]
    Signaling(#[from] signaling::SignalingError),
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),
    #[error("Connection error: {0}")]
    Connection(#[from] connection::ConnectionError),
    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),
    #[error("Multiplexer error: {0}")]
    Mux(#[from] channel::MuxError),
    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),
    #[error("Offline store error: {0}")]
    Offline(#[from] offline::OfflineError),
    #[error("Search error: {0}")]
    Search(#[from] search::SearchError),
    #[error("Transfer error: {0}")]
    Transfer(#[from] transfer::TransferError),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
}
