// Configuration management for the ananta CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/ananta/config.json
// - Linux: ~/.config/ananta/config.json
// - Windows: %APPDATA%\ananta\config.json

use ananta_core::NodeConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Everything the node itself consumes
    pub node: NodeConfig,

    /// Peers reachable on the local network, peer id -> host:port
    pub lan_peers: BTreeMap<String, String>,

    /// Daily rolling log files go here when set
    pub log_dir: Option<String>,
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn show<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "(unset)".to_string())
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("ananta");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("ananta");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn add_lan_peer(&mut self, peer_id: &str, addr: &str) -> Result<()> {
        addr.parse::<SocketAddr>()
            .with_context(|| format!("Invalid address: {}", addr))?;
        self.lan_peers.insert(peer_id.to_string(), addr.to_string());
        self.save()
    }

    pub fn remove_lan_peer(&mut self, peer_id: &str) -> Result<bool> {
        let removed = self.lan_peers.remove(peer_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// LAN peers whose address parses
    pub fn lan_peer_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.lan_peers
            .iter()
            .filter_map(|(id, addr)| addr.parse().ok().map(|a| (id.clone(), a)))
            .collect()
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory. An empty value clears optional keys.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let node = &mut self.node;
        match key {
            "http_url" => node.signaling.http_url = optional(value),
            "http_poll_ms" => {
                node.signaling.http_poll_ms = value.parse().context("Invalid number")?;
            }
            "websocket_url" => node.signaling.websocket_url = optional(value),
            "websocket_reconnect_ms" => {
                node.signaling.websocket_reconnect_ms = value.parse().context("Invalid number")?;
            }
            "local_port" => {
                node.signaling.local_port = match optional(value) {
                    Some(port) => Some(port.parse().context("Invalid port number")?),
                    None => None,
                };
            }
            "advertise_ip" => {
                node.engine.advertise_ip = value.parse().context("Invalid IP address")?;
            }
            "connect_timeout_ms" => {
                node.connection.connect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "reconnect_delay_ms" => {
                node.connection.reconnect_delay_ms = value.parse().context("Invalid number")?;
            }
            "search_ttl" => {
                node.search.default_ttl = value.parse().context("Invalid number")?;
            }
            "min_trust_rank" => {
                node.search.min_trust_rank = value.parse().context("Invalid number")?;
            }
            "relay_trust_threshold" => {
                node.offline.relay_trust_threshold = value.parse().context("Invalid number")?;
            }
            "purge_on_delivery" => {
                node.offline.purge_on_delivery = value.parse().context("Invalid boolean value")?;
            }
            "chunk_size" => {
                let size: usize = value.parse().context("Invalid number")?;
                if size == 0 {
                    anyhow::bail!("Chunk size must be positive");
                }
                node.transfer.chunk_size = size;
            }
            "download_dir" => node.transfer.download_dir = optional(value).map(PathBuf::from),
            "log_dir" => self.log_dir = optional(value),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let node = &self.node;
        let download_dir = node
            .transfer
            .download_dir
            .as_ref()
            .map(|p| p.display().to_string());
        vec![
            ("http_url".to_string(), show(&node.signaling.http_url)),
            ("http_poll_ms".to_string(), node.signaling.http_poll_ms.to_string()),
            ("websocket_url".to_string(), show(&node.signaling.websocket_url)),
            (
                "websocket_reconnect_ms".to_string(),
                node.signaling.websocket_reconnect_ms.to_string(),
            ),
            ("local_port".to_string(), show(&node.signaling.local_port)),
            ("advertise_ip".to_string(), node.engine.advertise_ip.to_string()),
            (
                "connect_timeout_ms".to_string(),
                node.connection.connect_timeout_ms.to_string(),
            ),
            (
                "reconnect_delay_ms".to_string(),
                node.connection.reconnect_delay_ms.to_string(),
            ),
            ("search_ttl".to_string(), node.search.default_ttl.to_string()),
            ("min_trust_rank".to_string(), node.search.min_trust_rank.to_string()),
            (
                "relay_trust_threshold".to_string(),
                node.offline.relay_trust_threshold.to_string(),
            ),
            (
                "purge_on_delivery".to_string(),
                node.offline.purge_on_delivery.to_string(),
            ),
            ("chunk_size".to_string(), node.transfer.chunk_size.to_string()),
            ("download_dir".to_string(), show(&download_dir)),
            ("log_dir".to_string(), show(&self.log_dir)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.node.signaling.is_empty());
        assert!(config.lan_peers.is_empty());
        assert_eq!(config.get("search_ttl").as_deref(), Some("3"));
        assert_eq!(config.get("http_url").as_deref(), Some("(unset)"));
        assert!(config.get("no_such_key").is_none());
    }

    #[test]
    fn test_apply_and_clear() {
        let mut config = Config::default();
        config.apply("http_url", "https://signal.example").unwrap();
        config.apply("local_port", "7400").unwrap();
        config.apply("purge_on_delivery", "true").unwrap();
        assert_eq!(
            config.node.signaling.http_url.as_deref(),
            Some("https://signal.example")
        );
        assert_eq!(config.node.signaling.local_port, Some(7400));
        assert!(config.node.offline.purge_on_delivery);

        config.apply("http_url", "").unwrap();
        config.apply("local_port", "").unwrap();
        assert!(config.node.signaling.is_empty());
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.apply("local_port", "seventy").is_err());
        assert!(config.apply("chunk_size", "0").is_err());
        assert!(config.apply("unknown", "1").is_err());
        assert_eq!(config.node.transfer.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config
            .lan_peers
            .insert("abc".to_string(), "192.168.1.20:7400".to_string());
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.node, config.node);
        assert_eq!(
            deserialized.lan_peer_addrs(),
            vec![("abc".to_string(), "192.168.1.20:7400".parse().unwrap())]
        );
    }
}
