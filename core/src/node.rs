// Node: the composition root
//
// Builds every service once, wires them together explicitly and routes
// inbound multiplexer traffic by stream label and prefix. Nothing here is a
// global; an application may run several nodes in one process.

use crate::channel::{ChannelListener, ChannelMultiplexer, StreamLabel, StreamSender};
use crate::config::{NodeConfig, SignalingSettings};
use crate::connection::{ConnectionOrchestrator, ConnectionRequestRegistry, ConnectionState};
use crate::engine::{PeerConnectionFactory, TcpEngine};
use crate::identity::IdentityKeys;
use crate::offline::{OfflineManager, OfflineStore};
use crate::relay::{RelayCoordinator, RELAY_CTRL_PREFIX};
use crate::search::{DiscoveryKind, DiscoveryMessage, SearchFilter, SearchManager, SharedFileIndex};
use crate::signaling::{
    short_id, CompositeSignaling, HttpSignaling, LocalSignaling, SignalingTransport,
    StaticDiscovery, WebSocketSignaling,
};
use crate::store::{MemoryStorage, SledStorage, StorageBackend};
use crate::transfer::{
    DirectorySink, FileReceiver, FileSender, FileTransferLedger, ReceiveQueue, TransferSink,
    FILE_REQUEST_PREFIX,
};
use crate::trust::{MemoryTrustDirectory, TrustDirectory};
use crate::CoreError;
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Called with `(peer id, message)` for every chat message
pub type ChatListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct NodeBuilder {
    config: NodeConfig,
    keys: Option<IdentityKeys>,
    signaling: Option<Arc<dyn SignalingTransport>>,
    engine: Option<Arc<dyn PeerConnectionFactory>>,
    storage: Option<Arc<dyn StorageBackend>>,
    trust: Option<Arc<dyn TrustDirectory>>,
    sink: Option<Arc<dyn TransferSink>>,
}

impl NodeBuilder {
    pub fn identity(mut self, keys: IdentityKeys) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Use this transport instead of the backends named in the config
    pub fn signaling(mut self, signaling: Arc<dyn SignalingTransport>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn PeerConnectionFactory>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn trust(mut self, trust: Arc<dyn TrustDirectory>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn TransferSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn build(self) -> Result<Node, CoreError> {
        let config = self.config;
        let keys = self.keys.unwrap_or_else(IdentityKeys::generate);
        let local_id = keys.peer_id();

        let storage: Arc<dyn StorageBackend> = match (self.storage, &config.storage_path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(SledStorage::open(&path.to_string_lossy())?),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        let mut backends = Backends::default();
        let signaling = match self.signaling {
            Some(signaling) => signaling,
            None => backends.build(&config.signaling, &keys).await?,
        };

        let engine: Arc<dyn PeerConnectionFactory> = match self.engine {
            Some(engine) => engine,
            None => TcpEngine::new(config.engine.advertise_ip),
        };
        let trust: Arc<dyn TrustDirectory> = match self.trust {
            Some(trust) => trust,
            None => Arc::new(MemoryTrustDirectory::new()),
        };
        let sink: Arc<dyn TransferSink> = match self.sink {
            Some(sink) => sink,
            None => {
                let dir = config
                    .transfer
                    .download_dir
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("ananta-downloads"));
                Arc::new(DirectorySink::new(dir)?)
            }
        };

        let requests = Arc::new(ConnectionRequestRegistry::new());
        let orchestrator = ConnectionOrchestrator::new(
            &local_id,
            signaling.clone(),
            engine,
            requests.clone(),
            config.orchestrator_config(),
        );
        let mux = Arc::new(ChannelMultiplexer::new(config.channel.buffer_threshold));
        orchestrator.add_observer(mux.clone());
        let sender: Arc<dyn StreamSender> = mux.clone();

        let offline = Arc::new(
            OfflineManager::new(
                &local_id,
                config.offline_config(),
                sender.clone(),
                OfflineStore::new(storage.clone()),
                trust.clone(),
            )
            .with_signer(keys.clone()),
        );
        let relay = Arc::new(RelayCoordinator::new(&local_id, sender.clone(), offline.clone()));
        let shared = Arc::new(SharedFileIndex::open(storage.clone())?);
        let search = Arc::new(SearchManager::new(
            &local_id,
            config.search_config(),
            sender.clone(),
            shared.clone(),
            trust.clone(),
        ));
        let ledger = Arc::new(FileTransferLedger::open(storage)?);
        let files = Arc::new(FileSender::new(
            sender,
            ledger.clone(),
            config.transfer_config(),
        ));
        let receiver = Arc::new(FileReceiver::new(ledger.clone(), sink, trust.clone()));
        let incoming = ReceiveQueue::new(receiver);

        let router = Arc::new(InboundRouter {
            relay: relay.clone(),
            search: search.clone(),
            offline: offline.clone(),
            incoming,
            files: files.clone(),
            shared: shared.clone(),
            chat_listeners: RwLock::new(Vec::new()),
        });
        mux.add_listener(router.clone());

        info!("Node {} built", short_id(&local_id));
        Ok(Node {
            local_id,
            keys,
            config,
            backends,
            orchestrator,
            requests,
            mux,
            relay,
            offline,
            search,
            shared,
            ledger,
            files,
            trust,
            router,
        })
    }
}

/// Backends created from config, started only once the orchestrator listens
#[derive(Default)]
struct Backends {
    http: Option<(Arc<HttpSignaling>, Duration)>,
    websocket: Option<Arc<WebSocketSignaling>>,
    local: Option<Arc<LocalSignaling>>,
}

impl Backends {
    async fn build(
        &mut self,
        settings: &SignalingSettings,
        keys: &IdentityKeys,
    ) -> Result<Arc<dyn SignalingTransport>, CoreError> {
        let local_id = keys.peer_id();
        let mut all: Vec<Arc<dyn SignalingTransport>> = Vec::new();

        if let Some(url) = &settings.http_url {
            let http = HttpSignaling::new(url, &local_id);
            all.push(http.clone());
            self.http = Some((http, Duration::from_millis(settings.http_poll_ms)));
        }
        if let Some(url) = &settings.websocket_url {
            let ws = WebSocketSignaling::new(
                url,
                &local_id,
                &keys.public_key_hex(),
                Duration::from_millis(settings.websocket_reconnect_ms),
            );
            all.push(ws.clone());
            self.websocket = Some(ws);
        }
        if let Some(port) = settings.local_port {
            let listen = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            let local = LocalSignaling::bind(&local_id, listen, StaticDiscovery::new()).await?;
            all.push(local.clone());
            self.local = Some(local);
        }

        match all.len() {
            0 => Err(CoreError::Config("no signaling backend configured".into())),
            1 => Ok(all.remove(0)),
            _ => Ok(Arc::new(CompositeSignaling::new(all))),
        }
    }

    fn start(&self) {
        if let Some((http, interval)) = &self.http {
            http.start_polling(*interval);
        }
        if let Some(ws) = &self.websocket {
            ws.start();
        }
    }
}

pub struct Node {
    local_id: String,
    keys: IdentityKeys,
    config: NodeConfig,
    backends: Backends,
    orchestrator: Arc<ConnectionOrchestrator>,
    requests: Arc<ConnectionRequestRegistry>,
    mux: Arc<ChannelMultiplexer>,
    relay: Arc<RelayCoordinator>,
    offline: Arc<OfflineManager>,
    search: Arc<SearchManager>,
    shared: Arc<SharedFileIndex>,
    ledger: Arc<FileTransferLedger>,
    files: Arc<FileSender>,
    trust: Arc<dyn TrustDirectory>,
    router: Arc<InboundRouter>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            keys: None,
            signaling: None,
            engine: None,
            storage: None,
            trust: None,
            sink: None,
        }
    }

    /// Start listening for signals and engine events. Needs a tokio runtime.
    pub fn start(&self) {
        self.orchestrator.start();
        self.backends.start();
        info!("Node {} started", short_id(&self.local_id));
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        info!("Node {} stopped", short_id(&self.local_id));
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub fn requests(&self) -> &Arc<ConnectionRequestRegistry> {
        &self.requests
    }

    pub fn multiplexer(&self) -> &Arc<ChannelMultiplexer> {
        &self.mux
    }

    pub fn relay(&self) -> &Arc<RelayCoordinator> {
        &self.relay
    }

    pub fn offline(&self) -> &Arc<OfflineManager> {
        &self.offline
    }

    pub fn search_manager(&self) -> &Arc<SearchManager> {
        &self.search
    }

    pub fn shared_files(&self) -> &Arc<SharedFileIndex> {
        &self.shared
    }

    pub fn ledger(&self) -> &Arc<FileTransferLedger> {
        &self.ledger
    }

    pub fn trust(&self) -> &Arc<dyn TrustDirectory> {
        &self.trust
    }

    /// Local-network signaling, when enabled in the config
    pub fn local_signaling(&self) -> Option<&Arc<LocalSignaling>> {
        self.backends.local.as_ref()
    }

    // Pairing

    pub async fn request_connection(&self, peer_id: &str) -> Result<(), CoreError> {
        Ok(self.orchestrator.request_connection(peer_id).await?)
    }

    pub async fn accept_connection(&self, peer_id: &str) -> Result<(), CoreError> {
        Ok(self.orchestrator.accept_connection(peer_id).await?)
    }

    pub fn decline_connection(&self, peer_id: &str) {
        self.orchestrator.decline_connection(peer_id);
    }

    pub async fn close_connection(&self, peer_id: &str) {
        self.orchestrator.close_connection(peer_id).await;
    }

    pub fn connection_state(&self, peer_id: &str) -> ConnectionState {
        self.orchestrator.state(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.orchestrator.connected_peers()
    }

    // Messaging

    pub fn add_chat_listener(&self, listener: ChatListener) {
        self.router.chat_listeners.write().push(listener);
    }

    pub fn send_chat(&self, peer_id: &str, text: &str) -> Result<(), CoreError> {
        Ok(self.mux.send_text(peer_id, StreamLabel::Chat, text)?)
    }

    // Search and files

    pub fn search(&self, query: &str) -> Result<String, CoreError> {
        Ok(self.search.search(query)?)
    }

    pub fn search_with(&self, query: &str, filter: SearchFilter) -> Result<String, CoreError> {
        Ok(self.search.search_with(query, filter)?)
    }

    pub fn share_path(&self, path: &Path) -> Result<(), CoreError> {
        Ok(self.shared.share_path(path)?)
    }

    pub fn request_file(&self, peer_id: &str, name: &str) -> Result<(), CoreError> {
        Ok(self.search.request_file(peer_id, name)?)
    }

    /// Stream a file to a peer, returning the transfer id when done
    pub async fn send_file(&self, peer_id: &str, path: &Path) -> Result<String, CoreError> {
        Ok(self.files.send_file(peer_id, path).await?)
    }
}

/// Dispatches decrypted multiplexer traffic to the services
struct InboundRouter {
    relay: Arc<RelayCoordinator>,
    search: Arc<SearchManager>,
    offline: Arc<OfflineManager>,
    /// File traffic is applied off the engine event loop
    incoming: ReceiveQueue,
    files: Arc<FileSender>,
    shared: Arc<SharedFileIndex>,
    chat_listeners: RwLock<Vec<ChatListener>>,
}

impl InboundRouter {
    fn serve_file(&self, peer_id: &str, name: &str) {
        let Some(path) = self.shared.resolve(name) else {
            debug!("{} asked for unshared file {}", short_id(peer_id), name);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to serve {} to {}", name, short_id(peer_id));
            return;
        };
        let files = self.files.clone();
        let peer_id = peer_id.to_string();
        runtime.spawn(async move {
            if let Err(e) = files.send_file(&peer_id, &path).await {
                warn!("Serving {} to {} failed: {}", path.display(), short_id(&peer_id), e);
            }
        });
    }
}

impl ChannelListener for InboundRouter {
    fn on_text(&self, peer_id: &str, label: StreamLabel, text: &str) {
        match label {
            StreamLabel::Chat => {
                if text.starts_with(RELAY_CTRL_PREFIX) {
                    self.relay.handle_control(peer_id, text);
                    return;
                }
                let listeners = self.chat_listeners.read().clone();
                for listener in listeners {
                    listener(peer_id, text);
                }
            }
            StreamLabel::File => {
                if let Some(name) = text.strip_prefix(FILE_REQUEST_PREFIX) {
                    self.serve_file(peer_id, name);
                } else {
                    self.incoming.push_text(peer_id, text);
                }
            }
            StreamLabel::Discovery => match DiscoveryMessage::from_json(text) {
                Ok(message) => match message.kind {
                    DiscoveryKind::Search | DiscoveryKind::Response => {
                        self.search.handle_message(peer_id, &message)
                    }
                    DiscoveryKind::RelayRequest | DiscoveryKind::RelayReady => {
                        self.relay.handle_discovery(peer_id, &message)
                    }
                },
                Err(e) => debug!("Bad discovery message from {}: {}", short_id(peer_id), e),
            },
            StreamLabel::OfflineMsg => self.offline.handle_message(peer_id, text),
            StreamLabel::Relay => debug!("Text on relay stream from {}", short_id(peer_id)),
        }
    }

    fn on_binary(&self, peer_id: &str, label: StreamLabel, data: &[u8]) {
        match label {
            StreamLabel::File => self.incoming.push_chunk(peer_id, data),
            StreamLabel::Relay => self.relay.handle_data(peer_id, data),
            other => debug!("Binary on {} from {}", other, short_id(peer_id)),
        }
    }

    fn on_peer_ready(&self, peer_id: &str) {
        info!("Peer {} ready", short_id(peer_id));
        if let Err(e) = self.offline.request_messages(peer_id, 0) {
            debug!("Offline retrieve from {} not sent: {}", short_id(peer_id), e);
        }
    }

    fn on_peer_closed(&self, peer_id: &str) {
        self.incoming.peer_closed(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, MemoryNetwork};
    use crate::signaling::LoopbackHub;

    #[tokio::test]
    async fn test_build_requires_signaling() {
        let result = Node::builder(NodeConfig::default())
            .engine(MemoryEngine::new(MemoryNetwork::new()))
            .build()
            .await;
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_with_injected_collaborators() {
        let hub = LoopbackHub::new();
        let keys = IdentityKeys::generate();
        let dir = tempfile::tempdir().unwrap();
        let node = Node::builder(NodeConfig::default())
            .identity(keys.clone())
            .signaling(hub.connect(&keys.peer_id()))
            .engine(MemoryEngine::new(MemoryNetwork::new()))
            .sink(Arc::new(DirectorySink::new(dir.path()).unwrap()))
            .build()
            .await
            .unwrap();
        node.start();

        assert_eq!(node.local_id(), keys.peer_id());
        assert!(node.connected_peers().is_empty());
        assert_eq!(node.connection_state("nobody"), ConnectionState::Idle);
        assert!(node.send_chat("nobody", "hi").is_err());
        node.shutdown().await;
        assert!(node.orchestrator().is_shut_down());
    }
}
