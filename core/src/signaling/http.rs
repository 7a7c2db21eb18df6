// HTTP polling signaling backend
//
// Outbound: POST {server}/message with the JSON envelope.
// Inbound:  GET {server}/messages?id={local_id} on a fixed interval, returning
//           a JSON array of envelopes addressed to us.
//
// ureq is blocking, so every request runs on the blocking pool.

use super::{
    short_id, ListenerSlot, SignalKind, SignalListener, SignalingEnvelope, SignalingError,
    SignalingTransport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpSignaling {
    server_url: String,
    local_id: String,
    agent: ureq::Agent,
    slot: ListenerSlot,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSignaling {
    pub fn new(server_url: &str, local_id: &str) -> Arc<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(REQUEST_TIMEOUT)
            .timeout_read(REQUEST_TIMEOUT)
            .build();
        Arc::new(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            local_id: local_id.to_string(),
            agent,
            slot: ListenerSlot::default(),
            poller: Mutex::new(None),
        })
    }

    /// Start polling the inbox every `interval`
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = this.poll_once().await {
                    warn!("Signaling poll failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.poller.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Fetch and dispatch pending envelopes once
    pub async fn poll_once(&self) -> Result<usize, SignalingError> {
        let agent = self.agent.clone();
        let url = format!("{}/messages", self.server_url);
        let id = self.local_id.clone();

        let body = tokio::task::spawn_blocking(move || -> Result<String, SignalingError> {
            let response = agent
                .get(&url)
                .query("id", &id)
                .call()
                .map_err(|e| SignalingError::Transport(e.to_string()))?;
            response
                .into_string()
                .map_err(|e| SignalingError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))??;

        let envelopes = parse_inbox(&body);
        let count = envelopes.len();
        for mut envelope in envelopes {
            if envelope.to.is_empty() {
                envelope.to = self.local_id.clone();
            }
            self.slot.deliver(&self.local_id, envelope);
        }
        Ok(count)
    }
}

/// Decode an inbox body, skipping entries that do not parse
fn parse_inbox(body: &str) -> Vec<SignalingEnvelope> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    let values: Vec<serde_json::Value> = match serde_json::from_str(body) {
        Ok(values) => values,
        Err(e) => {
            debug!("Dropping malformed inbox body: {}", e);
            return Vec::new();
        }
    };
    values
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!("Dropping malformed envelope: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl SignalingTransport for HttpSignaling {
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError> {
        let envelope = SignalingEnvelope::new(&self.local_id, to, kind, data);
        let body = serde_json::to_value(&envelope)
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;
        let agent = self.agent.clone();
        let url = format!("{}/message", self.server_url);

        tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .send_json(body)
                .map(|_| ())
                .map_err(|e| SignalingError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))??;

        debug!("Sent {} to {} via HTTP", kind, short_id(to));
        Ok(())
    }

    fn set_listener(&self, listener: SignalListener) {
        self.slot.set(listener);
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}
