// Local-network signaling: service discovery + one-line-per-connection TCP
//
// Each node advertises `Ananta-<peer id>` on its accept port. Outbound
// envelopes open a fresh socket to the peer's advertised address, write one
// JSON line and close. Unreachable endpoints are dropped silently.

use super::{
    short_id, ListenerSlot, SignalKind, SignalListener, SignalingEnvelope, SignalingError,
    SignalingTransport,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Service name prefix advertised on the local network
pub const SERVICE_PREFIX: &str = "Ananta-";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub type DiscoveryCallback = Arc<dyn Fn(&str, SocketAddr) + Send + Sync>;

/// Local service discovery collaborator (mDNS/NSD on real platforms)
pub trait ServiceDiscovery: Send + Sync {
    fn register_service(&self, service_name: &str, addr: SocketAddr);
    /// Report every known and future service through `on_found`
    fn discover(&self, on_found: DiscoveryCallback);
    fn stop(&self);
}

/// Discovery over a fixed, shared table of services.
///
/// Nodes in one process can share a single instance; the CLI seeds it with
/// manually configured peers.
#[derive(Default)]
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, SocketAddr>>,
    watchers: RwLock<Vec<DiscoveryCallback>>,
}

impl StaticDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn register_service(&self, service_name: &str, addr: SocketAddr) {
        self.services.write().insert(service_name.to_string(), addr);
        let watchers = self.watchers.read().clone();
        for watcher in watchers {
            watcher(service_name, addr);
        }
    }

    fn discover(&self, on_found: DiscoveryCallback) {
        let known: Vec<(String, SocketAddr)> = self
            .services
            .read()
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();
        for (name, addr) in known {
            on_found(&name, addr);
        }
        self.watchers.write().push(on_found);
    }

    fn stop(&self) {
        self.watchers.write().clear();
    }
}

pub struct LocalSignaling {
    local_id: String,
    local_addr: SocketAddr,
    discovery: Arc<dyn ServiceDiscovery>,
    directory: Arc<RwLock<HashMap<String, SocketAddr>>>,
    slot: ListenerSlot,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSignaling {
    /// Bind the accept socket, advertise ourselves and start discovery.
    ///
    /// `listen` with port 0 picks an ephemeral port.
    pub async fn bind(
        local_id: &str,
        listen: SocketAddr,
        discovery: Arc<dyn ServiceDiscovery>,
    ) -> Result<Arc<Self>, SignalingError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        let this = Arc::new(Self {
            local_id: local_id.to_string(),
            local_addr,
            discovery,
            directory: Arc::new(RwLock::new(HashMap::new())),
            slot: ListenerSlot::default(),
            accept_task: Mutex::new(None),
        });

        let slot = this.slot.clone();
        let id = this.local_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(read_envelopes(stream, slot.clone(), id.clone()));
                    }
                    Err(e) => debug!("Local signaling accept failed: {}", e),
                }
            }
        });
        *this.accept_task.lock() = Some(handle);

        let directory = this.directory.clone();
        let own_id = this.local_id.clone();
        this.discovery.discover(Arc::new(move |service_name: &str, addr: SocketAddr| {
            let Some(peer_id) = service_name.strip_prefix(SERVICE_PREFIX) else {
                return;
            };
            if peer_id == own_id {
                return;
            }
            directory.write().insert(peer_id.to_string(), addr);
        }));
        this.discovery
            .register_service(&format!("{}{}", SERVICE_PREFIX, local_id), local_addr);

        info!("Local signaling listening on {}", local_addr);
        Ok(this)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self, peer_id: &str) -> Option<SocketAddr> {
        self.directory.read().get(peer_id).copied()
    }

    /// Manually add a directory entry
    pub fn add_peer(&self, peer_id: &str, addr: SocketAddr) {
        self.directory.write().insert(peer_id.to_string(), addr);
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.directory.read().keys().cloned().collect()
    }
}

async fn read_envelopes(stream: TcpStream, slot: ListenerSlot, local_id: String) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match SignalingEnvelope::from_json(&line) {
                    Ok(envelope) => slot.deliver(&local_id, envelope),
                    Err(e) => debug!("Ignoring malformed local envelope: {}", e),
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!("Local signaling read failed: {}", e);
                return;
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for LocalSignaling {
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError> {
        let addr = self
            .peer_addr(to)
            .ok_or_else(|| SignalingError::UnknownPeer(to.to_string()))?;
        let mut line = SignalingEnvelope::new(&self.local_id, to, kind, data).to_json()?;
        line.push('\n');

        let result = async {
            let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
            stream.write_all(line.as_bytes()).await?;
            stream.shutdown().await
        }
        .await;

        if let Err(e) = result {
            debug!("Local signaling to {} at {} dropped: {}", short_id(to), addr, e);
        }
        Ok(())
    }

    fn set_listener(&self, listener: SignalListener) {
        self.slot.set(listener);
    }

    async fn shutdown(&self) {
        self.discovery.stop();
        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
    }
}
