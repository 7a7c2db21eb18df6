// Search manager: flood queries, answer from the local index, route responses
//
// A node remembers which peer each foreign request came from. Responses for
// those requests are passed back toward that peer with our id appended to the
// path; responses for our own requests go to the listeners.

use super::protocol::{
    DiscoveryKind, DiscoveryMessage, SearchFilter, SearchRequest, SearchResponse, DEFAULT_TTL,
};
use super::{SearchError, SeenRequests, SharedFileIndex};
use crate::channel::{StreamLabel, StreamSender};
use crate::signaling::short_id;
use crate::trust::TrustDirectory;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SearchListener = Arc<dyn Fn(&SearchResponse) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub default_ttl: u32,
    /// Responses from peers ranked below this are dropped
    pub min_trust_rank: f64,
    pub seen_capacity: usize,
    pub seen_ttl: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            min_trust_rank: 0.0,
            seen_capacity: 4096,
            seen_ttl: Duration::from_secs(600),
        }
    }
}

pub struct SearchManager {
    local_id: String,
    config: SearchConfig,
    sender: Arc<dyn StreamSender>,
    shared: Arc<SharedFileIndex>,
    trust: Arc<dyn TrustDirectory>,
    seen: SeenRequests,
    listeners: RwLock<Vec<SearchListener>>,
}

impl SearchManager {
    pub fn new(
        local_id: &str,
        config: SearchConfig,
        sender: Arc<dyn StreamSender>,
        shared: Arc<SharedFileIndex>,
        trust: Arc<dyn TrustDirectory>,
    ) -> Self {
        let seen = SeenRequests::new(config.seen_capacity, config.seen_ttl);
        Self {
            local_id: local_id.to_string(),
            config,
            sender,
            shared,
            trust,
            seen,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: SearchListener) {
        self.listeners.write().push(listener);
    }

    pub fn shared_files(&self) -> &Arc<SharedFileIndex> {
        &self.shared
    }

    /// Flood `query` to every connected peer. Returns the request id.
    pub fn search(&self, query: &str) -> Result<String, SearchError> {
        self.search_with(query, SearchFilter::default())
    }

    pub fn search_with(&self, query: &str, filter: SearchFilter) -> Result<String, SearchError> {
        let request = SearchRequest {
            request_id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            ttl: self.config.default_ttl,
            sender_id: self.local_id.clone(),
            min_trust: (self.config.min_trust_rank > 0.0).then_some(self.config.min_trust_rank),
            types: (!filter.types.is_empty()).then(|| filter.types.clone()),
            min_size: filter.min_size,
            max_size: filter.max_size,
        };
        self.seen.insert(&request.request_id, None);

        let json = DiscoveryMessage::wrap(DiscoveryKind::Search, &request)?.to_json()?;
        let reached = self.sender.broadcast_text(StreamLabel::Discovery, &json, None);
        info!("Search {:?} sent to {} peers", query, reached);
        Ok(request.request_id)
    }

    /// Handle a `search` or `response` discovery message from `peer_id`
    pub fn handle_message(&self, peer_id: &str, message: &DiscoveryMessage) {
        let result = match message.kind {
            DiscoveryKind::Search => message
                .body::<SearchRequest>()
                .and_then(|request| self.handle_request(peer_id, request)),
            DiscoveryKind::Response => message
                .body::<SearchResponse>()
                .and_then(|response| self.handle_response(peer_id, response)),
            DiscoveryKind::RelayRequest | DiscoveryKind::RelayReady => Ok(()),
        };
        if let Err(e) = result {
            debug!("Dropping discovery message from {}: {}", short_id(peer_id), e);
        }
    }

    fn handle_request(&self, peer_id: &str, request: SearchRequest) -> Result<(), SearchError> {
        if !self.seen.insert(&request.request_id, Some(peer_id)) {
            debug!("Already processed search {}", request.request_id);
            return Ok(());
        }

        let results = self.shared.search(&request.query, &request.filter());
        if !results.is_empty() {
            let response = SearchResponse {
                request_id: request.request_id.clone(),
                results,
                peer_id: self.local_id.clone(),
                path: vec![self.local_id.clone()],
                trust_rank: None,
            };
            let json = DiscoveryMessage::wrap(DiscoveryKind::Response, &response)?.to_json()?;
            if let Err(e) = self.sender.send_text(peer_id, StreamLabel::Discovery, &json) {
                warn!(
                    "Answer to search {} not sent to {}: {}",
                    request.request_id,
                    short_id(peer_id),
                    e
                );
            }
        }

        if request.ttl > 0 {
            let forwarded = request.forwarded();
            let json = DiscoveryMessage::wrap(DiscoveryKind::Search, &forwarded)?.to_json()?;
            let reached = self.sender.broadcast_text(StreamLabel::Discovery, &json, None);
            debug!(
                "Forwarded search {} with ttl {} to {} peers",
                forwarded.request_id, forwarded.ttl, reached
            );
        }
        Ok(())
    }

    fn handle_response(&self, peer_id: &str, mut response: SearchResponse) -> Result<(), SearchError> {
        match self.seen.source(&response.request_id) {
            Some(Some(source)) => {
                response.path.push(self.local_id.clone());
                let json = DiscoveryMessage::wrap(DiscoveryKind::Response, &response)?.to_json()?;
                self.sender
                    .send_text(&source, StreamLabel::Discovery, &json)?;
                debug!(
                    "Relayed response {} from {} toward {}",
                    response.request_id,
                    short_id(peer_id),
                    short_id(&source)
                );
            }
            Some(None) => {
                let rank = f64::from(self.trust.trust_level(&response.peer_id).unwrap_or(0));
                if rank < self.config.min_trust_rank {
                    debug!(
                        "Dropping response from {} with trust rank {}",
                        short_id(&response.peer_id),
                        rank
                    );
                    return Ok(());
                }
                response.trust_rank = Some(rank);
                let listeners = self.listeners.read().clone();
                for listener in listeners {
                    listener(&response);
                }
            }
            None => debug!("Response for unknown search {}", response.request_id),
        }
        Ok(())
    }

    /// Ask `peer_id` to send us one of its shared files
    pub fn request_file(&self, peer_id: &str, name: &str) -> Result<(), SearchError> {
        self.sender.send_text(
            peer_id,
            StreamLabel::File,
            &format!("{}{}", crate::transfer::FILE_REQUEST_PREFIX, name),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use crate::testing::RecordingSender;
    use crate::trust::{MemoryTrustDirectory, MockTrustDirectory};
    use parking_lot::Mutex;

    fn manager(
        id: &str,
        sender: Arc<RecordingSender>,
        trust: Arc<dyn TrustDirectory>,
        config: SearchConfig,
    ) -> SearchManager {
        let shared = Arc::new(SharedFileIndex::open(Arc::new(MemoryStorage::new())).unwrap());
        SearchManager::new(id, config, sender, shared, trust)
    }

    fn decode(json: &str) -> DiscoveryMessage {
        DiscoveryMessage::from_json(json).unwrap()
    }

    fn request(id: &str, query: &str, ttl: u32) -> DiscoveryMessage {
        let request = SearchRequest {
            request_id: id.into(),
            query: query.into(),
            ttl,
            sender_id: "alice".into(),
            min_trust: None,
            types: None,
            min_size: None,
            max_size: None,
        };
        DiscoveryMessage::wrap(DiscoveryKind::Search, &request).unwrap()
    }

    #[test]
    fn test_search_floods_with_default_ttl() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("bob");
        sender.connect("carol");
        let search = manager(
            "alice",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );

        let id = search.search("video").unwrap();
        for peer in ["bob", "carol"] {
            let sent = sender.texts_to(peer, StreamLabel::Discovery);
            assert_eq!(sent.len(), 1);
            let request: SearchRequest = decode(&sent[0]).body().unwrap();
            assert_eq!(request.request_id, id);
            assert_eq!(request.ttl, 3);
            assert_eq!(request.sender_id, "alice");
        }
    }

    #[test]
    fn test_duplicate_request_is_processed_once() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("alice");
        sender.connect("carol");
        let bob = manager(
            "bob",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );
        bob.shared_files().share("/v/video.mp4", 10, None).unwrap();

        bob.handle_message("alice", &request("r1", "video", 3));
        bob.handle_message("carol", &request("r1", "video", 2));

        // One answer to alice, one forward to each connected peer
        let to_alice = sender.texts_to("alice", StreamLabel::Discovery);
        assert_eq!(to_alice.len(), 2);
        assert_eq!(decode(&to_alice[0]).kind, DiscoveryKind::Response);
        let forwarded: SearchRequest = decode(&to_alice[1]).body().unwrap();
        assert_eq!(forwarded.ttl, 2);
        assert_eq!(sender.texts_to("carol", StreamLabel::Discovery).len(), 1);
    }

    #[test]
    fn test_unreachable_requester_does_not_stop_flooding() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("carol");
        sender.connect("dave");
        let bob = manager(
            "bob",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );
        bob.shared_files().share("/v/video.mp4", 10, None).unwrap();

        // alice dropped before bob could answer
        bob.handle_message("alice", &request("r3", "video", 3));

        assert!(sender.texts_to("alice", StreamLabel::Discovery).is_empty());
        for peer in ["carol", "dave"] {
            let sent = sender.texts_to(peer, StreamLabel::Discovery);
            assert_eq!(sent.len(), 1);
            let forwarded: SearchRequest = decode(&sent[0]).body().unwrap();
            assert_eq!(forwarded.request_id, "r3");
            assert_eq!(forwarded.ttl, 2);
        }
    }

    #[test]
    fn test_zero_ttl_is_not_forwarded() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("alice");
        sender.connect("carol");
        let bob = manager(
            "bob",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );
        bob.handle_message("alice", &request("r2", "nothing", 0));
        assert!(sender.texts.lock().is_empty());
    }

    #[test]
    fn test_response_relayed_toward_source_with_path() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("alice");
        sender.connect("carol");
        let bob = manager(
            "bob",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );
        bob.handle_message("alice", &request("r3", "x", 1));

        let response = SearchResponse {
            request_id: "r3".into(),
            results: vec![],
            peer_id: "carol".into(),
            path: vec!["carol".into()],
            trust_rank: None,
        };
        bob.handle_message(
            "carol",
            &DiscoveryMessage::wrap(DiscoveryKind::Response, &response).unwrap(),
        );

        let to_alice = sender.texts_to("alice", StreamLabel::Discovery);
        let relayed: SearchResponse = decode(to_alice.last().unwrap()).body().unwrap();
        assert_eq!(relayed.peer_id, "carol");
        assert_eq!(relayed.path, vec!["carol".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_originator_filters_by_trust_rank() {
        let sender = Arc::new(RecordingSender::new());
        let mut trust = MockTrustDirectory::new();
        trust
            .expect_trust_level()
            .returning(|peer| if peer == "trusted" { Some(4) } else { Some(1) });
        let config = SearchConfig {
            min_trust_rank: 2.0,
            ..Default::default()
        };
        let alice = manager("alice", sender, Arc::new(trust), config);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        alice.add_listener(Arc::new(move |r: &SearchResponse| {
            sink.lock().push((r.peer_id.clone(), r.trust_rank))
        }));

        let id = alice.search("x").unwrap();
        for responder in ["trusted", "stranger"] {
            let response = SearchResponse {
                request_id: id.clone(),
                results: vec![],
                peer_id: responder.into(),
                path: vec![responder.into()],
                trust_rank: None,
            };
            alice.handle_message(
                responder,
                &DiscoveryMessage::wrap(DiscoveryKind::Response, &response).unwrap(),
            );
        }

        assert_eq!(
            received.lock().as_slice(),
            [("trusted".to_string(), Some(4.0))]
        );
    }

    #[test]
    fn test_request_file_uses_file_stream() {
        let sender = Arc::new(RecordingSender::new());
        sender.connect("bob");
        let alice = manager(
            "alice",
            sender.clone(),
            Arc::new(MemoryTrustDirectory::new()),
            SearchConfig::default(),
        );
        alice.request_file("bob", "video.mp4").unwrap();
        assert_eq!(
            sender.texts_to("bob", StreamLabel::File),
            vec!["FILE_REQUEST:video.mp4".to_string()]
        );
        assert!(alice.request_file("nobody", "x").is_err());
    }
}
