// Offline message stream wire format

use super::OfflineError;
use crate::identity::{peer_id_from_public_key, IdentityKeys};
use serde::{Deserialize, Serialize};

/// A message held on behalf of a peer that was not reachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub recipient: String,
    pub sender: String,
    /// Base64 ciphertext, opaque to the holder
    pub payload: String,
    /// Milliseconds since the Unix epoch
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl OfflineRecord {
    pub fn new(recipient: &str, sender: &str, payload: String, ts: u64) -> Self {
        Self {
            recipient: recipient.to_string(),
            sender: sender.to_string(),
            payload,
            ts,
            sig: None,
        }
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.recipient.len() + self.sender.len() + self.payload.len() + 11,
        );
        bytes.extend_from_slice(self.recipient.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.sender.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.payload.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.ts.to_be_bytes());
        bytes
    }

    /// Sign with the sender's identity key
    pub fn sign(&mut self, keys: &IdentityKeys) {
        self.sig = Some(hex::encode(keys.sign(&self.signing_bytes())));
    }

    /// True if `public_key` belongs to the sender and produced `sig`
    pub fn verify_with(&self, public_key: &[u8; 32]) -> bool {
        if peer_id_from_public_key(public_key) != self.sender {
            return false;
        }
        let Some(sig) = self.sig.as_deref().and_then(|s| hex::decode(s).ok()) else {
            return false;
        };
        IdentityKeys::verify(&self.signing_bytes(), &sig, public_key).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub recipient: String,
    #[serde(default)]
    pub ts_since: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineBundle {
    pub messages: Vec<OfflineRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OfflineKind {
    Store,
    Retrieve,
    Bundle,
}

/// `{type, payload}` with the body JSON-encoded into `payload`
#[derive(Serialize, Deserialize)]
struct Wrapper {
    #[serde(rename = "type")]
    kind: OfflineKind,
    payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineMessage {
    Store(OfflineRecord),
    Retrieve(RetrieveRequest),
    Bundle(OfflineBundle),
}

impl OfflineMessage {
    pub fn to_json(&self) -> Result<String, OfflineError> {
        let (kind, payload) = match self {
            OfflineMessage::Store(record) => (OfflineKind::Store, serde_json::to_string(record)),
            OfflineMessage::Retrieve(req) => (OfflineKind::Retrieve, serde_json::to_string(req)),
            OfflineMessage::Bundle(bundle) => (OfflineKind::Bundle, serde_json::to_string(bundle)),
        };
        let payload = payload.map_err(|e| OfflineError::Serialization(e.to_string()))?;
        serde_json::to_string(&Wrapper { kind, payload })
            .map_err(|e| OfflineError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, OfflineError> {
        let wrapper: Wrapper =
            serde_json::from_str(json).map_err(|e| OfflineError::Serialization(e.to_string()))?;
        let body = wrapper.payload.as_str();
        let message = match wrapper.kind {
            OfflineKind::Store => serde_json::from_str(body).map(OfflineMessage::Store),
            OfflineKind::Retrieve => serde_json::from_str(body).map(OfflineMessage::Retrieve),
            OfflineKind::Bundle => serde_json::from_str(body).map(OfflineMessage::Bundle),
        };
        message.map_err(|e| OfflineError::Serialization(e.to_string()))
    }
}
