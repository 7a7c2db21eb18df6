// Crypto module: forward-secure per-channel ratchet

pub mod ratchet;

pub use ratchet::{RatchetError, RatchetSession, HELLO_PREFIX, MSG_PREFIX};
