// Shared harness: nodes on one loopback hub and one in-memory network
#![allow(dead_code)]

use ananta_core::engine::{MemoryEngine, MemoryNetwork};
use ananta_core::signaling::{CompositeSignaling, LoopbackHub, SignalingTransport};
use ananta_core::transfer::{DirectorySink, TransferSink};
use ananta_core::trust::TrustDirectory;
use ananta_core::{IdentityKeys, Node, NodeConfig, StreamLabel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Mesh {
    hub: Arc<LoopbackHub>,
    network: Arc<MemoryNetwork>,
    dirs: Vec<TempDir>,
}

impl Mesh {
    pub fn new() -> Self {
        init_tracing();
        Self {
            hub: LoopbackHub::new(),
            network: MemoryNetwork::new(),
            dirs: Vec::new(),
        }
    }

    /// A started node that writes downloads into its own temp directory
    pub async fn node(&mut self) -> (Node, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().to_path_buf();
        let sink: Arc<dyn TransferSink> = Arc::new(DirectorySink::new(&downloads).unwrap());
        self.dirs.push(dir);
        let node = self.build(Node::builder(NodeConfig::default()).sink(sink)).await;
        (node, downloads)
    }

    pub async fn node_with_trust(&mut self, trust: Arc<dyn TrustDirectory>) -> (Node, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().to_path_buf();
        let sink: Arc<dyn TransferSink> = Arc::new(DirectorySink::new(&downloads).unwrap());
        self.dirs.push(dir);
        let node = self
            .build(Node::builder(NodeConfig::default()).sink(sink).trust(trust))
            .await;
        (node, downloads)
    }

    /// A started node signaling over this mesh's hub and `second` at once
    pub async fn node_on_two_hubs(&mut self, second: &Arc<LoopbackHub>) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let sink: Arc<dyn TransferSink> = Arc::new(DirectorySink::new(dir.path()).unwrap());
        self.dirs.push(dir);

        let keys = IdentityKeys::generate();
        let id = keys.peer_id();
        let first: Arc<dyn SignalingTransport> = self.hub.connect(&id);
        let backends = vec![first, second.connect(&id)];
        let node = Node::builder(NodeConfig::default())
            .sink(sink)
            .signaling(Arc::new(CompositeSignaling::new(backends)))
            .engine(MemoryEngine::new(self.network.clone()))
            .identity(keys)
            .build()
            .await
            .unwrap();
        node.start();
        node
    }

    async fn build(&self, builder: ananta_core::NodeBuilder) -> Node {
        let keys = IdentityKeys::generate();
        let node = builder
            .signaling(self.hub.connect(&keys.peer_id()))
            .engine(MemoryEngine::new(self.network.clone()))
            .identity(keys)
            .build()
            .await
            .unwrap();
        node.start();
        node
    }
}

/// Log to the test writer; `RUST_LOG=debug` shows the node chatter
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn all_streams_ready(node: &Node, peer_id: &str) -> bool {
    StreamLabel::ALL
        .iter()
        .all(|label| node.multiplexer().is_ready(peer_id, *label))
}

/// Request from `a`, accept on `b`, wait until every stream is ready both ways
pub async fn pair(a: &Node, b: &Node) {
    a.request_connection(b.local_id()).await.unwrap();
    assert!(
        wait_until(|| b
            .requests()
            .get(a.local_id())
            .map_or(false, |state| state.incoming))
        .await,
        "request never arrived"
    );
    b.accept_connection(a.local_id()).await.unwrap();
    assert!(
        wait_until(|| all_streams_ready(a, b.local_id()) && all_streams_ready(b, a.local_id()))
            .await,
        "streams never became ready"
    );
}
