// Node configuration
//
// Plain numbers (milliseconds, bytes) so the file stays readable. Every
// section has defaults, so a partial document is a valid config.

use crate::channel::DEFAULT_BUFFER_THRESHOLD;
use crate::connection::OrchestratorConfig;
use crate::offline::{OfflineConfig, DEFAULT_RELAY_TRUST_THRESHOLD};
use crate::search::{SearchConfig, DEFAULT_TTL};
use crate::transfer::{TransferConfig, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub signaling: SignalingSettings,
    pub engine: EngineSettings,
    pub connection: ConnectionSettings,
    pub channel: ChannelSettings,
    pub search: SearchSettings,
    pub offline: OfflineSettings,
    pub transfer: TransferSettings,
    /// sled directory; in-memory storage when unset
    pub storage_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    /// HTTP relay server polled for envelopes
    pub http_url: Option<String>,
    pub http_poll_ms: u64,
    /// Push socket server
    pub websocket_url: Option<String>,
    pub websocket_reconnect_ms: u64,
    /// Port for local-network signaling, 0 for an ephemeral port
    pub local_port: Option<u16>,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            http_url: None,
            http_poll_ms: 2_000,
            websocket_url: None,
            websocket_reconnect_ms: 5_000,
            local_port: None,
        }
    }
}

impl SignalingSettings {
    pub fn is_empty(&self) -> bool {
        self.http_url.is_none() && self.websocket_url.is_none() && self.local_port.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Address LAN peers can dial us at
    pub advertise_ip: IpAddr,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            advertise_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_backoff_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3_000,
            connect_timeout_ms: 10_000,
            connect_backoff_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Binary sends fail with backpressure above this many buffered bytes
    pub buffer_threshold: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_ttl: u32,
    pub seen_capacity: usize,
    pub seen_ttl_secs: u64,
    pub min_trust_rank: f64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            seen_capacity: 4_096,
            seen_ttl_secs: 600,
            min_trust_rank: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineSettings {
    pub relay_trust_threshold: u8,
    pub purge_on_delivery: bool,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            relay_trust_threshold: DEFAULT_RELAY_TRUST_THRESHOLD,
            purge_on_delivery: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub pause_poll_ms: u64,
    pub send_retry_ms: u64,
    /// Where received files are written
    pub download_dir: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pause_poll_ms: 200,
            send_retry_ms: 50,
            download_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            reconnect_delay: Duration::from_millis(self.connection.reconnect_delay_ms),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            connect_backoff: Duration::from_millis(self.connection.connect_backoff_ms),
        }
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            default_ttl: self.search.default_ttl,
            min_trust_rank: self.search.min_trust_rank,
            seen_capacity: self.search.seen_capacity,
            seen_ttl: Duration::from_secs(self.search.seen_ttl_secs),
        }
    }

    pub fn offline_config(&self) -> OfflineConfig {
        OfflineConfig {
            relay_trust_threshold: self.offline.relay_trust_threshold,
            purge_on_delivery: self.offline.purge_on_delivery,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.transfer.chunk_size,
            pause_poll: Duration::from_millis(self.transfer.pause_poll_ms),
            send_retry: Duration::from_millis(self.transfer.send_retry_ms),
        }
    }
}
