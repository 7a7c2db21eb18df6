// Ratchet-protected data channels and the stream multiplexer

pub mod multiplexer;

pub use multiplexer::{
    ChannelListener, ChannelMultiplexer, MuxError, StreamLabel, StreamSender,
    DEFAULT_BUFFER_THRESHOLD,
};

use crate::crypto::{RatchetError, RatchetSession, MSG_PREFIX};
use crate::engine::{DataChannel, EngineError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] RatchetError),
}

enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

struct SecureState {
    session: RatchetSession,
    pending: VecDeque<Outgoing>,
    closed: bool,
}

/// A data channel whose payloads ride a [`RatchetSession`].
///
/// Text goes out as `PFS_MSG:<base64>` control frames, binary as raw
/// `nonce || ciphertext`. Anything sent before the handshake completes is
/// queued and flushed in submission order once it does.
pub struct SecureChannel {
    channel: Arc<dyn DataChannel>,
    state: Mutex<SecureState>,
}

impl SecureChannel {
    pub fn new(channel: Arc<dyn DataChannel>, is_initiator: bool) -> Self {
        Self {
            channel,
            state: Mutex::new(SecureState {
                session: RatchetSession::new(is_initiator),
                pending: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().session.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn buffered_amount(&self) -> u64 {
        self.channel.buffered_amount()
    }

    /// Underlying channel opened: start the handshake
    pub fn on_open(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let channel = &self.channel;
        if let Err(e) = state.session.ensure_handshake(|frame| send_control(channel, &frame)) {
            debug!("Handshake on {} failed: {}", channel.label(), e);
        }
        self.flush_if_ready(&mut state);
    }

    pub fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send(Outgoing::Text(text.to_string()))
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.send(Outgoing::Binary(data.to_vec()))
    }

    fn send(&self, message: Outgoing) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if !state.session.is_ready() {
            state.pending.push_back(message);
            let channel = &self.channel;
            if channel.is_open() {
                state.session.ensure_handshake(|frame| send_control(channel, &frame))?;
            }
            return Ok(());
        }
        transmit(&mut state.session, self.channel.as_ref(), message)
    }

    /// Process an inbound text frame, returning decrypted application text
    pub fn handle_text(&self, frame: &str) -> Option<String> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let channel = &self.channel;
        if state
            .session
            .handle_control_frame(frame, |reply| send_control(channel, &reply))
        {
            self.flush_if_ready(&mut state);
            return None;
        }

        let encoded = frame.strip_prefix(MSG_PREFIX)?;
        match state.session.decrypt_text(encoded) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("Dropping undecryptable text on {}: {}", self.channel.label(), e);
                None
            }
        }
    }

    /// Process an inbound binary frame
    pub fn handle_binary(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if state.closed || !state.session.is_ready() {
            return None;
        }
        match state.session.decrypt_binary(data) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                debug!("Dropping undecryptable binary on {}: {}", self.channel.label(), e);
                None
            }
        }
    }

    /// Fail every later send and drop anything still queued
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        self.channel.close();
    }

    fn flush_if_ready(&self, state: &mut SecureState) {
        if !state.session.is_ready() {
            return;
        }
        while let Some(message) = state.pending.pop_front() {
            if let Err(e) = transmit(&mut state.session, self.channel.as_ref(), message) {
                debug!("Flush on {} failed: {}", self.channel.label(), e);
            }
        }
    }
}

fn transmit(
    session: &mut RatchetSession,
    channel: &dyn DataChannel,
    message: Outgoing,
) -> Result<(), ChannelError> {
    match message {
        Outgoing::Text(text) => {
            let encrypted = session.encrypt_text(&text)?;
            channel.send_text(&format!("{}{}", MSG_PREFIX, encrypted))?;
        }
        Outgoing::Binary(data) => {
            let encrypted = session.encrypt_binary(&data)?;
            channel.send_binary(&encrypted)?;
        }
    }
    Ok(())
}

fn send_control(channel: &Arc<dyn DataChannel>, frame: &str) {
    if let Err(e) = channel.send_text(frame) {
        debug!("Control frame on {} not sent: {}", channel.label(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Records what was written so a test can shuttle it to the other side
    #[derive(Default)]
    struct Wire {
        label: String,
        open: std::sync::atomic::AtomicBool,
        texts: PlMutex<Vec<String>>,
        binaries: PlMutex<Vec<Vec<u8>>>,
    }

    impl Wire {
        fn new(open: bool) -> Arc<Self> {
            let wire = Self {
                label: "chat".into(),
                ..Default::default()
            };
            wire.open.store(open, std::sync::atomic::Ordering::SeqCst);
            Arc::new(wire)
        }

        fn take_texts(&self) -> Vec<String> {
            std::mem::take(&mut *self.texts.lock())
        }

        fn take_binaries(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.binaries.lock())
        }
    }

    impl DataChannel for Wire {
        fn label(&self) -> &str {
            &self.label
        }
        fn is_open(&self) -> bool {
            self.open.load(std::sync::atomic::Ordering::SeqCst)
        }
        fn send_text(&self, text: &str) -> Result<(), EngineError> {
            self.texts.lock().push(text.to_string());
            Ok(())
        }
        fn send_binary(&self, data: &[u8]) -> Result<(), EngineError> {
            self.binaries.lock().push(data.to_vec());
            Ok(())
        }
        fn buffered_amount(&self) -> u64 {
            0
        }
        fn close(&self) {
            self.open.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn pump(from: &Wire, to: &SecureChannel) -> (Vec<String>, Vec<Vec<u8>>) {
        let texts = from
            .take_texts()
            .iter()
            .filter_map(|t| to.handle_text(t))
            .collect();
        let binaries = from
            .take_binaries()
            .iter()
            .filter_map(|b| to.handle_binary(b))
            .collect();
        (texts, binaries)
    }

    #[test]
    fn test_queued_messages_flush_in_order_after_handshake() {
        let wire_a = Wire::new(true);
        let wire_b = Wire::new(true);
        let a = SecureChannel::new(wire_a.clone(), true);
        let b = SecureChannel::new(wire_b.clone(), false);

        a.send_text("first").unwrap();
        a.send_text("second").unwrap();
        assert!(!a.is_ready());

        // a's hello reaches b; b answers with its own hello
        pump(&wire_a, &b);
        assert!(b.is_ready());
        pump(&wire_b, &a);
        assert!(a.is_ready());

        let (texts, _) = pump(&wire_a, &b);
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_binary_roundtrip_after_open() {
        let wire_a = Wire::new(true);
        let wire_b = Wire::new(true);
        let a = SecureChannel::new(wire_a.clone(), true);
        let b = SecureChannel::new(wire_b.clone(), false);

        a.on_open();
        b.on_open();
        pump(&wire_a, &b);
        pump(&wire_b, &a);
        assert!(a.is_ready() && b.is_ready());

        b.send_binary(&[9, 8, 7]).unwrap();
        let (_, binaries) = pump(&wire_b, &a);
        assert_eq!(binaries, vec![vec![9, 8, 7]]);
    }

    #[test]
    fn test_plaintext_frames_are_ignored() {
        let a = SecureChannel::new(Wire::new(true), true);
        assert_eq!(a.handle_text("RELAY_CTRL:x:y"), None);
        assert_eq!(a.handle_binary(&[0u8; 40]), None);
    }

    #[test]
    fn test_closed_channel_fails_fast() {
        let wire = Wire::new(true);
        let a = SecureChannel::new(wire.clone(), true);
        a.close();
        assert_eq!(a.send_text("late"), Err(ChannelError::Closed));
        assert!(!wire.is_open());
    }
}
