// Connection orchestrator: per-peer negotiation, timers and engine event fan-out
//
// Signals from one peer are handled in order by that peer's worker task, and
// negotiation for a peer runs under that peer's async lock. Different peers
// never wait on each other. Engine callbacks arrive on one event loop, are
// filtered by connection generation, and are forwarded to the observers.

use super::{
    ConnectionError, ConnectionObserver, ConnectionRequestRegistry, ConnectionState,
};
use crate::channel::StreamLabel;
use crate::engine::{
    EngineEvent, EventSink, IceState, PeerConnection, PeerConnectionFactory, PeerEvent,
    SessionDescription,
};
use crate::signaling::{short_id, IceCandidate, SignalKind, SignalingEnvelope, SignalingTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_PENDING_CANDIDATES: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Delay before reconnecting after a connection drops
    pub reconnect_delay: Duration,
    /// A peer still negotiating after this long is marked failed
    pub connect_timeout: Duration,
    /// Minimum spacing between two connection attempts to the same peer
    pub connect_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            connect_backoff: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub state: ConnectionState,
    pub is_initiator: bool,
    pub created_at: Option<Instant>,
}

/// Only touched while holding the peer's async lock
#[derive(Default)]
struct Negotiation {
    connection: Option<Arc<dyn PeerConnection>>,
    has_local_offer: bool,
    /// Offer the live connection answered, so a repeated copy is ignored
    remote_offer: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    last_attempt: Option<Instant>,
}

#[derive(Default)]
struct PeerStatus {
    state: ConnectionState,
    /// Generation of the live connection, 0 when there is none
    generation: u64,
    is_initiator: bool,
    created_at: Option<Instant>,
    reconnect: Option<JoinHandle<()>>,
    timeout: Option<JoinHandle<()>>,
}

pub struct ConnectionOrchestrator {
    local_id: String,
    config: OrchestratorConfig,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn PeerConnectionFactory>,
    requests: Arc<ConnectionRequestRegistry>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<Negotiation>>>>,
    peers: RwLock<HashMap<String, PeerStatus>>,
    approvals: RwLock<HashSet<String>>,
    signal_workers: Mutex<HashMap<String, mpsc::UnboundedSender<SignalingEnvelope>>>,
    next_generation: AtomicU64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    self_ref: Weak<ConnectionOrchestrator>,
}

impl ConnectionOrchestrator {
    pub fn new(
        local_id: &str,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn PeerConnectionFactory>,
        requests: Arc<ConnectionRequestRegistry>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|weak| Self {
            local_id: local_id.to_string(),
            config,
            signaling,
            factory,
            requests,
            observers: RwLock::new(Vec::new()),
            slots: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            approvals: RwLock::new(HashSet::new()),
            signal_workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            event_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn requests(&self) -> &Arc<ConnectionRequestRegistry> {
        &self.requests
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    /// Install the signaling listener and start consuming engine events
    pub fn start(self: &Arc<Self>) {
        let Some(mut events) = self.events_rx.lock().take() else {
            return;
        };

        let weak = Arc::downgrade(self);
        self.signaling
            .set_listener(Arc::new(move |envelope: SignalingEnvelope| {
                if let Some(this) = weak.upgrade() {
                    this.dispatch_signal(envelope);
                }
            }));

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_engine_event(event);
            }
        });
        *self.event_task.lock() = Some(task);
        info!("Connection orchestrator started for {}", short_id(&self.local_id));
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    pub fn approve(&self, peer_id: &str) {
        self.approvals.write().insert(peer_id.to_string());
    }

    pub fn is_approved(&self, peer_id: &str) -> bool {
        self.approvals.read().contains(peer_id)
    }

    /// True once a request/accept round trip has completed with `peer_id`
    pub fn is_confirmed(&self, peer_id: &str) -> bool {
        self.is_approved(peer_id)
    }

    fn revoke(&self, peer_id: &str) {
        self.approvals.write().remove(peer_id);
    }

    pub async fn request_connection(&self, peer_id: &str) -> Result<(), ConnectionError> {
        if peer_id == self.local_id {
            return Err(ConnectionError::SelfConnection);
        }
        self.requests.mark_outgoing(peer_id);
        self.signaling
            .send(SignalKind::ConnectRequest, peer_id, String::new())
            .await?;
        info!("Sent connection request to {}", short_id(peer_id));
        Ok(())
    }

    pub async fn accept_connection(&self, peer_id: &str) -> Result<(), ConnectionError> {
        self.requests.clear_incoming(peer_id);
        self.approve(peer_id);
        self.signaling
            .send(SignalKind::ConnectAccept, peer_id, String::new())
            .await?;
        info!("Accepted connection request from {}", short_id(peer_id));
        Ok(())
    }

    pub fn decline_connection(&self, peer_id: &str) {
        self.requests.clear_incoming(peer_id);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self, peer_id: &str) -> ConnectionState {
        self.peers
            .read()
            .get(peer_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).map(|s| PeerInfo {
            state: s.state,
            is_initiator: s.is_initiator,
            created_at: s.created_at,
        })
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .read()
            .iter()
            .filter(|(_, s)| s.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create a connection to `peer_id` and send our offer.
    ///
    /// Returns `Ok(false)` when the attempt was skipped: the peer is us, a
    /// connection is already negotiating or up, or the last attempt was
    /// within the backoff window.
    pub async fn initiate_connection(&self, peer_id: &str) -> Result<bool, ConnectionError> {
        self.dial(peer_id, true).await
    }

    /// The scheduled reconnect is already spaced by `reconnect_delay` and
    /// skips the backoff check, which may be the longer of the two.
    async fn dial(&self, peer_id: &str, backoff: bool) -> Result<bool, ConnectionError> {
        if self.is_shut_down() {
            return Err(ConnectionError::Shutdown);
        }
        if peer_id == self.local_id {
            return Ok(false);
        }
        if !self.is_approved(peer_id) {
            return Err(ConnectionError::NotApproved(peer_id.to_string()));
        }

        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;

        if matches!(
            self.state(peer_id),
            ConnectionState::Negotiating | ConnectionState::Connected
        ) {
            return Ok(false);
        }
        if let Some(last) = neg.last_attempt.filter(|_| backoff) {
            if last.elapsed() < self.config.connect_backoff {
                debug!("Backing off connection attempt to {}", short_id(peer_id));
                return Ok(false);
            }
        }
        neg.last_attempt = Some(Instant::now());
        self.cancel_reconnect(peer_id);

        match self.send_offer(peer_id, &mut neg).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Connection attempt to {} failed: {}", short_id(peer_id), e);
                self.dispose(peer_id, &mut neg);
                self.set_state(peer_id, ConnectionState::Failed);
                Err(e)
            }
        }
    }

    async fn send_offer(&self, peer_id: &str, neg: &mut Negotiation) -> Result<(), ConnectionError> {
        let connection = self.create_connection(peer_id, neg, true)?;
        self.set_state(peer_id, ConnectionState::Negotiating);
        self.schedule_timeout(peer_id);

        for label in StreamLabel::ALL {
            let channel = connection.create_data_channel(label.as_str())?;
            for observer in self.observers() {
                observer.on_channel(peer_id, channel.clone(), true);
            }
        }

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        neg.has_local_offer = true;
        self.signaling
            .send(SignalKind::Offer, peer_id, offer.sdp)
            .await?;
        debug!("Sent offer to {}", short_id(peer_id));
        Ok(())
    }

    /// Process one envelope from the signaling transport
    pub async fn handle_signal(&self, envelope: SignalingEnvelope) {
        let peer_id = envelope.from.as_str();
        if peer_id == self.local_id || self.is_shut_down() {
            return;
        }

        match envelope.kind {
            SignalKind::ConnectRequest => {
                info!("Connection request from {}", short_id(peer_id));
                self.requests.mark_incoming(peer_id);
            }
            SignalKind::ConnectAccept => self.handle_accept(peer_id).await,
            SignalKind::Offer => {
                if let Err(e) = self.handle_offer(peer_id, envelope.data).await {
                    self.fail(peer_id, e).await;
                }
            }
            SignalKind::Answer => {
                if let Err(e) = self.handle_answer(peer_id, envelope.data).await {
                    self.fail(peer_id, e).await;
                }
            }
            SignalKind::Candidate => self.handle_candidate(peer_id, &envelope.data).await,
        }
    }

    async fn handle_accept(&self, peer_id: &str) {
        let pending = self.requests.get(peer_id).unwrap_or_default();
        if !pending.outgoing {
            debug!("Ignoring unsolicited accept from {}", short_id(peer_id));
            return;
        }
        info!("{} accepted our connection request", short_id(peer_id));
        self.approve(peer_id);
        self.requests.clear(peer_id);

        // When both sides asked, only the polite peer dials
        if !pending.incoming || self.is_polite(peer_id) {
            if let Err(e) = self.initiate_connection(peer_id).await {
                warn!("Could not connect to {}: {}", short_id(peer_id), e);
            }
        }
    }

    async fn handle_offer(&self, peer_id: &str, sdp: String) -> Result<(), ConnectionError> {
        if !self.is_approved(peer_id) {
            debug!("Ignoring offer from unapproved peer {}", short_id(peer_id));
            return Ok(());
        }

        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;

        if neg.has_local_offer {
            if !self.is_polite(peer_id) {
                debug!("Offer glare with {}: keeping our offer", short_id(peer_id));
                return Ok(());
            }
            debug!("Offer glare with {}: answering theirs", short_id(peer_id));
        }
        if neg.connection.is_some() && neg.remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!("Duplicate offer from {}", short_id(peer_id));
            return Ok(());
        }
        self.cancel_reconnect(peer_id);

        let connection = self.create_connection(peer_id, &mut neg, false)?;
        self.set_state(peer_id, ConnectionState::Negotiating);
        self.schedule_timeout(peer_id);

        connection
            .set_remote_description(SessionDescription::offer(sdp.clone()))
            .await?;
        neg.remote_offer = Some(sdp);
        drain_candidates(peer_id, &mut neg, connection.as_ref());

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.signaling
            .send(SignalKind::Answer, peer_id, answer.sdp)
            .await?;
        debug!("Answered offer from {}", short_id(peer_id));
        Ok(())
    }

    async fn handle_answer(&self, peer_id: &str, sdp: String) -> Result<(), ConnectionError> {
        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;

        let Some(connection) = neg.connection.clone() else {
            debug!("Answer from {} without a connection", short_id(peer_id));
            return Ok(());
        };
        if !neg.has_local_offer {
            debug!("Unexpected answer from {}", short_id(peer_id));
            return Ok(());
        }

        connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        neg.has_local_offer = false;
        drain_candidates(peer_id, &mut neg, connection.as_ref());
        Ok(())
    }

    async fn handle_candidate(&self, peer_id: &str, data: &str) {
        if !self.is_approved(peer_id) {
            debug!("Dropping candidate from unapproved peer {}", short_id(peer_id));
            return;
        }
        let candidate = match IceCandidate::from_data(data) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!("Malformed candidate from {}: {}", short_id(peer_id), e);
                return;
            }
        };

        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;
        match neg.connection.clone() {
            Some(connection) if connection.has_remote_description() => {
                if let Err(e) = connection.add_ice_candidate(candidate) {
                    debug!("Candidate from {} rejected: {}", short_id(peer_id), e);
                }
            }
            _ if neg.pending_candidates.len() < MAX_PENDING_CANDIDATES => {
                neg.pending_candidates.push(candidate);
            }
            _ => debug!("Candidate buffer full for {}", short_id(peer_id)),
        }
    }

    /// Tear down the connection to `peer_id` and forget its pairing
    pub async fn close_connection(&self, peer_id: &str) {
        self.revoke(peer_id);
        self.teardown(peer_id).await;
        info!("Closed connection to {}", short_id(peer_id));
    }

    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut peers: HashSet<String> = self.slots.lock().keys().cloned().collect();
        peers.extend(self.peers.read().keys().cloned());
        for peer_id in peers {
            self.teardown(&peer_id).await;
        }

        self.signal_workers.lock().clear();
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.signaling.shutdown().await;
        info!("Connection orchestrator stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn dispatch_signal(&self, envelope: SignalingEnvelope) {
        if self.is_shut_down() || envelope.from == self.local_id {
            return;
        }
        let peer_id = envelope.from.clone();
        let mut workers = self.signal_workers.lock();
        let worker = workers
            .entry(peer_id.clone())
            .or_insert_with(|| self.spawn_signal_worker());
        if let Err(mpsc::error::SendError(envelope)) = worker.send(envelope) {
            let worker = self.spawn_signal_worker();
            if worker.send(envelope).is_ok() {
                workers.insert(peer_id, worker);
            }
        }
    }

    fn spawn_signal_worker(&self) -> mpsc::UnboundedSender<SignalingEnvelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_signal(envelope).await;
            }
        });
        tx
    }

    fn handle_engine_event(&self, event: PeerEvent) {
        let PeerEvent {
            peer_id,
            generation,
            event,
        } = event;
        if generation == 0 || self.generation(&peer_id) != generation {
            debug!("Dropping {:?} from stale connection to {}", event, short_id(&peer_id));
            return;
        }

        match event {
            EngineEvent::IceCandidate(candidate) => self.send_candidate(&peer_id, candidate),
            EngineEvent::StateChanged(state) => self.on_ice_state(&peer_id, state),
            EngineEvent::DataChannel(channel) => {
                for observer in self.observers() {
                    observer.on_channel(&peer_id, channel.clone(), false);
                }
            }
            EngineEvent::ChannelOpen(label) => {
                for observer in self.observers() {
                    observer.on_channel_open(&peer_id, &label);
                }
            }
            EngineEvent::Message { label, payload } => {
                for observer in self.observers() {
                    observer.on_message(&peer_id, &label, payload.clone());
                }
            }
        }
    }

    fn on_ice_state(&self, peer_id: &str, state: IceState) {
        debug!("ICE state for {}: {}", short_id(peer_id), state);
        match state {
            IceState::Connected | IceState::Completed => {
                self.cancel_timeout(peer_id);
                self.set_state(peer_id, ConnectionState::Connected);
            }
            IceState::Disconnected | IceState::Failed => {
                let next = if state == IceState::Failed {
                    ConnectionState::Failed
                } else {
                    ConnectionState::Disconnected
                };
                self.set_state(peer_id, next);
                for observer in self.observers() {
                    observer.on_closed(peer_id);
                }
                if self.is_approved(peer_id) && !self.is_shut_down() {
                    self.schedule_reconnect(peer_id);
                }
            }
            IceState::New | IceState::Checking | IceState::Closed => {}
        }
    }

    fn send_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        let data = match candidate.to_data() {
            Ok(data) => data,
            Err(e) => {
                debug!("Could not encode candidate: {}", e);
                return;
            }
        };
        let signaling = self.signaling.clone();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = signaling.send(SignalKind::Candidate, &peer, data).await {
                debug!("Candidate to {} not sent: {}", short_id(&peer), e);
            }
        });
    }

    fn create_connection(
        &self,
        peer_id: &str,
        neg: &mut Negotiation,
        is_initiator: bool,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        self.dispose(peer_id, neg);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut peers = self.peers.write();
            let status = peers.entry(peer_id.to_string()).or_default();
            status.generation = generation;
            status.is_initiator = is_initiator;
            status.created_at = Some(Instant::now());
        }

        let events = EventSink::new(peer_id, generation, self.events_tx.clone());
        let connection = self.factory.create(peer_id, events)?;
        neg.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Close the live connection, if any. Its later events become stale.
    fn dispose(&self, peer_id: &str, neg: &mut Negotiation) {
        neg.has_local_offer = false;
        neg.remote_offer = None;
        let Some(connection) = neg.connection.take() else {
            return;
        };
        if let Some(status) = self.peers.write().get_mut(peer_id) {
            status.generation = 0;
        }
        connection.close();
        for observer in self.observers() {
            observer.on_closed(peer_id);
        }
    }

    async fn fail(&self, peer_id: &str, error: ConnectionError) {
        warn!("Negotiation with {} failed: {}", short_id(peer_id), error);
        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;
        self.dispose(peer_id, &mut neg);
        self.set_state(peer_id, ConnectionState::Failed);
    }

    async fn teardown(&self, peer_id: &str) {
        if let Some(status) = self.peers.write().remove(peer_id) {
            abort(status.reconnect);
            abort(status.timeout);
        }
        // Sends must fail from here on, before we wait for the peer's lock
        for observer in self.observers() {
            observer.on_closed(peer_id);
        }

        let slot = self.slots.lock().remove(peer_id);
        if let Some(slot) = slot {
            let mut neg = slot.lock().await;
            if let Some(connection) = neg.connection.take() {
                connection.close();
            }
            neg.has_local_offer = false;
            neg.remote_offer = None;
            neg.pending_candidates.clear();
        }
    }

    fn schedule_timeout(&self, peer_id: &str) {
        let generation = self.generation(peer_id);
        let weak = self.self_ref.clone();
        let peer = peer_id.to_string();
        let delay = self.config.connect_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.on_connect_timeout(&peer, generation).await;
            }
        });

        let mut peers = self.peers.write();
        let status = peers.entry(peer_id.to_string()).or_default();
        abort(status.timeout.replace(handle));
    }

    fn cancel_timeout(&self, peer_id: &str) {
        if let Some(status) = self.peers.write().get_mut(peer_id) {
            abort(status.timeout.take());
        }
    }

    async fn on_connect_timeout(&self, peer_id: &str, generation: u64) {
        {
            let mut peers = self.peers.write();
            let Some(status) = peers.get_mut(peer_id) else {
                return;
            };
            if status.generation != generation || status.state != ConnectionState::Negotiating {
                return;
            }
            // Detach rather than abort: this is the running task
            status.timeout.take();
        }

        let slot = self.slot(peer_id);
        let mut neg = slot.lock().await;
        if self.generation(peer_id) != generation {
            return;
        }
        warn!("Connection to {} timed out", short_id(peer_id));
        self.requests.clear(peer_id);
        self.revoke(peer_id);
        self.dispose(peer_id, &mut neg);
        self.set_state(peer_id, ConnectionState::Failed);
    }

    fn schedule_reconnect(&self, peer_id: &str) {
        let weak = self.self_ref.clone();
        let peer = peer_id.to_string();
        let delay = self.config.reconnect_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            if let Some(status) = this.peers.write().get_mut(&peer) {
                status.reconnect.take();
            }
            info!("Reconnecting to {}", short_id(&peer));
            if let Err(e) = this.dial(&peer, false).await {
                debug!("Reconnect to {} failed: {}", short_id(&peer), e);
            }
        });

        let mut peers = self.peers.write();
        let status = peers.entry(peer_id.to_string()).or_default();
        abort(status.reconnect.replace(handle));
    }

    fn cancel_reconnect(&self, peer_id: &str) {
        if let Some(status) = self.peers.write().get_mut(peer_id) {
            abort(status.reconnect.take());
        }
    }

    fn set_state(&self, peer_id: &str, state: ConnectionState) {
        let changed = {
            let mut peers = self.peers.write();
            let status = peers.entry(peer_id.to_string()).or_default();
            let changed = status.state != state;
            status.state = state;
            changed
        };
        if changed {
            info!("Peer {} is now {}", short_id(peer_id), state);
            for observer in self.observers() {
                observer.on_state(peer_id, state);
            }
        }
    }

    fn generation(&self, peer_id: &str) -> u64 {
        self.peers
            .read()
            .get(peer_id)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    fn slot(&self, peer_id: &str) -> Arc<AsyncMutex<Negotiation>> {
        self.slots
            .lock()
            .entry(peer_id.to_string())
            .or_default()
            .clone()
    }

    /// The lexicographically smaller id yields on offer glare
    fn is_polite(&self, peer_id: &str) -> bool {
        self.local_id.as_str() < peer_id
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers.read().clone()
    }
}

fn drain_candidates(peer_id: &str, neg: &mut Negotiation, connection: &dyn PeerConnection) {
    for candidate in neg.pending_candidates.drain(..) {
        if let Err(e) = connection.add_ice_candidate(candidate) {
            debug!("Buffered candidate from {} rejected: {}", short_id(peer_id), e);
        }
    }
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}
