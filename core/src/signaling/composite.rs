// Composite signaling: fan identical traffic out to every backend
//
// A peer reachable over several backends receives each envelope once per
// backend. Inbound copies are collapsed here so the orchestrator sees every
// envelope once.

use super::{
    short_id, SignalKind, SignalListener, SignalingEnvelope, SignalingError, SignalingTransport,
};
use crate::search::SeenRequests;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEDUP_CAPACITY: usize = 1024;
/// Copies of one envelope arrive within this window of each other
const DEDUP_WINDOW: Duration = Duration::from_secs(10);

pub struct CompositeSignaling {
    backends: Vec<Arc<dyn SignalingTransport>>,
    seen: Arc<SeenRequests>,
}

impl CompositeSignaling {
    pub fn new(backends: Vec<Arc<dyn SignalingTransport>>) -> Self {
        Self {
            backends,
            seen: Arc::new(SeenRequests::new(DEDUP_CAPACITY, DEDUP_WINDOW)),
        }
    }

    pub fn backends(&self) -> &[Arc<dyn SignalingTransport>] {
        &self.backends
    }
}

fn fingerprint(envelope: &SignalingEnvelope) -> String {
    let kind = envelope.kind.to_string();
    let mut hasher = blake3::Hasher::new();
    for part in [&envelope.from, &envelope.to, &kind, &envelope.data] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[async_trait]
impl SignalingTransport for CompositeSignaling {
    /// Succeeds if at least one backend accepted the envelope
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError> {
        if self.backends.is_empty() {
            return Err(SignalingError::NotConnected);
        }

        let results = join_all(
            self.backends
                .iter()
                .map(|backend| backend.send(kind, to, data.clone())),
        )
        .await;

        let mut last_error = None;
        let mut delivered = 0usize;
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => last_error = Some(e),
            }
        }
        debug!(
            "Fanned {} to {} over {}/{} backends",
            kind,
            short_id(to),
            delivered,
            self.backends.len()
        );

        match (delivered, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn set_listener(&self, listener: SignalListener) {
        let seen = self.seen.clone();
        let deduped: SignalListener = Arc::new(move |envelope: SignalingEnvelope| {
            if seen.insert(&fingerprint(&envelope), None) {
                listener(envelope);
            } else {
                debug!(
                    "Dropping duplicate {} from {}",
                    envelope.kind,
                    short_id(&envelope.from)
                );
            }
        });
        for backend in &self.backends {
            backend.set_listener(deduped.clone());
        }
    }

    async fn shutdown(&self) {
        join_all(self.backends.iter().map(|backend| backend.shutdown())).await;
    }
}
