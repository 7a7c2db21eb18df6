// Discovery stream wire format
//
// Every message on the discovery stream is `{type, payload}` where payload is
// itself a JSON document (search request / response) or a plain string
// (relay setup).

use super::SearchError;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TTL: u32 = 3;

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Search,
    Response,
    RelayRequest,
    RelayReady,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub payload: String,
}

impl DiscoveryMessage {
    pub fn new(kind: DiscoveryKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Wrap a JSON-encodable body
    pub fn wrap<T: Serialize>(kind: DiscoveryKind, body: &T) -> Result<Self, SearchError> {
        let payload =
            serde_json::to_string(body).map_err(|e| SearchError::Serialization(e.to_string()))?;
        Ok(Self::new(kind, payload))
    }

    pub fn to_json(&self) -> Result<String, SearchError> {
        serde_json::to_string(self).map_err(|e| SearchError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SearchError> {
        serde_json::from_str(json).map_err(|e| SearchError::Serialization(e.to_string()))
    }

    pub fn body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, SearchError> {
        serde_json::from_str(&self.payload).map_err(|e| SearchError::Serialization(e.to_string()))
    }
}

/// Optional constraints on what a responder may return
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// File extensions, with or without the leading dot
    pub types: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(rename = "id")]
    pub request_id: String,
    #[serde(rename = "q")]
    pub query: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(rename = "sender")]
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_trust: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u64>,
}

impl SearchRequest {
    pub fn filter(&self) -> SearchFilter {
        SearchFilter {
            types: self.types.clone().unwrap_or_default(),
            min_size: self.min_size,
            max_size: self.max_size,
        }
    }

    /// Copy for the next hop, one TTL spent
    pub fn forwarded(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFile {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(rename = "rid")]
    pub request_id: String,
    pub results: Vec<SharedFile>,
    /// The peer that holds the results
    #[serde(rename = "peer")]
    pub peer_id: String,
    /// Peers the response passed through, responder first
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_rank: Option<f64>,
}
