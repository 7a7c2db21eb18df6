// Offline manager: hold records for absent peers and hand them over on request

use super::{OfflineBundle, OfflineError, OfflineMessage, OfflineRecord, OfflineStore, RetrieveRequest};
use crate::channel::{StreamLabel, StreamSender};
use crate::identity::IdentityKeys;
use crate::signaling::short_id;
use crate::trust::TrustDirectory;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Third-party records are held only for recipients trusted above this level
pub const DEFAULT_RELAY_TRUST_THRESHOLD: u8 = 3;

/// Called with the peer that delivered a bundle and its records
pub type BundleListener = Arc<dyn Fn(&str, &[OfflineRecord]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub relay_trust_threshold: u8,
    /// Delete records once they have been bundled to their recipient
    pub purge_on_delivery: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            relay_trust_threshold: DEFAULT_RELAY_TRUST_THRESHOLD,
            purge_on_delivery: false,
        }
    }
}

pub struct OfflineManager {
    local_id: String,
    config: OfflineConfig,
    sender: Arc<dyn StreamSender>,
    store: OfflineStore,
    trust: Arc<dyn TrustDirectory>,
    signer: Option<IdentityKeys>,
    listeners: RwLock<Vec<BundleListener>>,
}

impl OfflineManager {
    pub fn new(
        local_id: &str,
        config: OfflineConfig,
        sender: Arc<dyn StreamSender>,
        store: OfflineStore,
        trust: Arc<dyn TrustDirectory>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            config,
            sender,
            store,
            trust,
            signer: None,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Sign records we originate with our identity key
    pub fn with_signer(mut self, keys: IdentityKeys) -> Self {
        self.signer = Some(keys);
        self
    }

    pub fn add_bundle_listener(&self, listener: BundleListener) {
        self.listeners.write().push(listener);
    }

    pub fn store_handle(&self) -> &OfflineStore {
        &self.store
    }

    /// Persist a record locally for `recipient`
    pub fn store(&self, recipient: &str, sender: &str, payload: &[u8]) -> Result<OfflineRecord, OfflineError> {
        let record = OfflineRecord::new(recipient, sender, BASE64.encode(payload), now_millis());
        self.store.store(&record)?;
        debug!(
            "Stored offline record from {} for {}",
            short_id(sender),
            short_id(recipient)
        );
        Ok(record)
    }

    /// Hold a relayed message for `recipient` if we trust them enough.
    /// Returns whether the message was stored.
    pub fn store_relay_message(&self, recipient: &str, sender: &str, payload: &[u8]) -> bool {
        let level = self.trust.trust_level(recipient).unwrap_or(0);
        if level <= self.config.relay_trust_threshold {
            debug!(
                "Not holding relay message for {} (trust {})",
                short_id(recipient),
                level
            );
            return false;
        }
        match self.store(recipient, sender, payload) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to store relay message for {}: {}", short_id(recipient), e);
                false
            }
        }
    }

    /// Ask `peer_id` for everything it holds for us since `ts_since`
    pub fn request_messages(&self, peer_id: &str, ts_since: u64) -> Result<(), OfflineError> {
        let message = OfflineMessage::Retrieve(RetrieveRequest {
            recipient: self.local_id.clone(),
            ts_since,
        });
        self.send(peer_id, &message)
    }

    /// Ask a connected `peer_id` to hold `payload` until `recipient` shows up
    pub fn store_message(&self, peer_id: &str, recipient: &str, payload: &[u8]) -> Result<(), OfflineError> {
        let mut record = OfflineRecord::new(
            recipient,
            &self.local_id,
            BASE64.encode(payload),
            now_millis(),
        );
        if let Some(keys) = &self.signer {
            record.sign(keys);
        }
        self.send(peer_id, &OfflineMessage::Store(record))
    }

    /// Handle a message from the offline stream
    pub fn handle_message(&self, peer_id: &str, text: &str) {
        let message = match OfflineMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping offline message from {}: {}", short_id(peer_id), e);
                return;
            }
        };
        let result = match message {
            OfflineMessage::Store(record) => self.handle_store(peer_id, record),
            OfflineMessage::Retrieve(request) => self.handle_retrieve(peer_id, request),
            OfflineMessage::Bundle(bundle) => {
                info!(
                    "Received {} offline messages from {}",
                    bundle.messages.len(),
                    short_id(peer_id)
                );
                let listeners = self.listeners.read().clone();
                for listener in listeners {
                    listener(peer_id, &bundle.messages);
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Offline request from {} failed: {}", short_id(peer_id), e);
        }
    }

    fn handle_store(&self, peer_id: &str, record: OfflineRecord) -> Result<(), OfflineError> {
        // Peers may only deposit their own messages
        if record.sender != peer_id {
            debug!(
                "Refusing record from {} claiming sender {}",
                short_id(peer_id),
                short_id(&record.sender)
            );
            return Ok(());
        }
        self.store.store(&record)
    }

    fn handle_retrieve(&self, peer_id: &str, request: RetrieveRequest) -> Result<(), OfflineError> {
        if request.recipient != peer_id {
            debug!(
                "{} asked for records of {}",
                short_id(peer_id),
                short_id(&request.recipient)
            );
            return Ok(());
        }
        let (keys, messages): (Vec<_>, Vec<_>) = self
            .store
            .retrieve_keyed(peer_id, request.ts_since)?
            .into_iter()
            .unzip();
        if messages.is_empty() {
            return Ok(());
        }
        let count = messages.len();
        self.send(peer_id, &OfflineMessage::Bundle(OfflineBundle { messages }))?;
        info!("Delivered {} offline messages to {}", count, short_id(peer_id));

        // Only what went out in the bundle; later deposits wait for the next retrieve
        if self.config.purge_on_delivery {
            self.store.remove(&keys)?;
        }
        Ok(())
    }

    fn send(&self, peer_id: &str, message: &OfflineMessage) -> Result<(), OfflineError> {
        self.sender
            .send_text(peer_id, StreamLabel::OfflineMsg, &message.to_json()?)?;
        Ok(())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
