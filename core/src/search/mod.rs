// Gossip search over the discovery stream

pub mod manager;
pub mod protocol;
pub mod seen;
pub mod shared;

pub use manager::{SearchConfig, SearchListener, SearchManager};
pub use protocol::{
    DiscoveryKind, DiscoveryMessage, SearchFilter, SearchRequest, SearchResponse, SharedFile,
    DEFAULT_TTL,
};
pub use seen::SeenRequests;
pub use shared::SharedFileIndex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Send failed: {0}")]
    Send(#[from] crate::channel::MuxError),
}
