//! Relay: forward traffic between two peers through a third
//!
//! The same coordinator plays both roles. A session id it recorded while
//! answering a relay request makes it the intermediary for that session; any
//! other session id means it is one of the two endpoints.

pub mod coordinator;
pub mod framing;

pub use coordinator::{ControlListener, DataListener, ReadyListener, RelayCoordinator, RelaySession};
pub use framing::{pack, unpack, RELAY_CTRL_PREFIX, RELAY_REQUEST_PREFIX};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Send failed: {0}")]
    Send(#[from] crate::channel::MuxError),
}
