// In-process signaling hub for tests and single-process meshes

use super::{ListenerSlot, SignalKind, SignalListener, SignalingEnvelope, SignalingError, SignalingTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes envelopes between loopback endpoints by peer id
#[derive(Default)]
pub struct LoopbackHub {
    endpoints: RwLock<HashMap<String, ListenerSlot>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `peer_id` on the hub and return its transport
    pub fn connect(self: &Arc<Self>, peer_id: &str) -> Arc<LoopbackSignaling> {
        let slot = ListenerSlot::default();
        self.endpoints
            .write()
            .insert(peer_id.to_string(), slot.clone());
        Arc::new(LoopbackSignaling {
            local_id: peer_id.to_string(),
            hub: self.clone(),
            slot,
        })
    }

    fn route(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        let slot = self
            .endpoints
            .read()
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| SignalingError::UnknownPeer(envelope.to.clone()))?;
        let to = envelope.to.clone();
        slot.deliver(&to, envelope);
        Ok(())
    }

    fn disconnect(&self, peer_id: &str) {
        self.endpoints.write().remove(peer_id);
    }
}

pub struct LoopbackSignaling {
    local_id: String,
    hub: Arc<LoopbackHub>,
    slot: ListenerSlot,
}

#[async_trait]
impl SignalingTransport for LoopbackSignaling {
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError> {
        self.hub
            .route(SignalingEnvelope::new(&self.local_id, to, kind, data))
    }

    fn set_listener(&self, listener: SignalListener) {
        self.slot.set(listener);
    }

    async fn shutdown(&self) {
        self.hub.disconnect(&self.local_id);
    }
}
