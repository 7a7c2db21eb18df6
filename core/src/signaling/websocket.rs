// Push-socket signaling backend over a single long-lived WebSocket
//
// Wire protocol with the rendezvous server:
//   -> {"type":"register","peerId":..,"publicKey":..}           on every (re)connect
//   -> {"type":"signal","to":..,"toPublicKey":..,"payload":{"type":..,"data":..}}
//   <- {"type":"signal","from":..,"fromPublicKey":..,"payload":{"type":..,"data":..}}
//
// On failure the socket is re-dialed after a fixed delay; nothing queued
// while disconnected is replayed.

use super::{
    short_id, ListenerSlot, SignalKind, SignalListener, SignalingEnvelope, SignalingError,
    SignalingTransport,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
struct WirePayload {
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Register {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(rename = "fromPublicKey", default, skip_serializing_if = "Option::is_none")]
        from_public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(rename = "toPublicKey", default, skip_serializing_if = "Option::is_none")]
        to_public_key: Option<String>,
        payload: WirePayload,
    },
}

pub struct WebSocketSignaling {
    server_url: String,
    local_id: String,
    public_key: String,
    reconnect_delay: Duration,
    slot: ListenerSlot,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    pub fn new(
        server_url: &str,
        local_id: &str,
        public_key: &str,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_url: normalize_ws_url(server_url),
            local_id: local_id.to_string(),
            public_key: public_key.to_string(),
            reconnect_delay,
            slot: ListenerSlot::default(),
            outbound: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Spawn the connect/reconnect loop
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match tokio_tungstenite::connect_async(this.server_url.as_str()).await {
                    Ok((stream, _)) => {
                        info!("Signaling socket connected to {}", this.server_url);
                        this.run_session(stream).await;
                        *this.outbound.lock() = None;
                        warn!("Signaling socket to {} closed", this.server_url);
                    }
                    Err(e) => {
                        warn!("Signaling socket connect to {} failed: {}", this.server_url, e);
                    }
                }
                tokio::time::sleep(this.reconnect_delay).await;
            }
        });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run_session<S>(&self, stream: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = stream.split();

        let register = WireMessage::Register {
            peer_id: self.local_id.clone(),
            public_key: self.public_key.clone(),
        };
        let Ok(register) = serde_json::to_string(&register) else {
            return;
        };
        if ws_tx.send(WsMessage::Text(register)).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(text) = outgoing else { return };
                    if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                        warn!("Signaling socket send failed: {}", e);
                        return;
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text(&text),
                        Some(Ok(WsMessage::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling socket read failed: {}", e);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_inbound(text, &self.local_id) {
            Some(envelope) => self.slot.deliver(&self.local_id, envelope),
            None => debug!("Ignoring non-signal socket message"),
        }
    }
}

fn decode_inbound(text: &str, local_id: &str) -> Option<SignalingEnvelope> {
    match serde_json::from_str::<WireMessage>(text).ok()? {
        WireMessage::Signal {
            from,
            from_public_key,
            payload,
            ..
        } => {
            let from = from.or(from_public_key).filter(|f| !f.is_empty())?;
            Some(SignalingEnvelope::new(&from, local_id, payload.kind, payload.data))
        }
        WireMessage::Register { .. } => None,
    }
}

fn normalize_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else {
        url.to_string()
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn send(&self, kind: SignalKind, to: &str, data: String) -> Result<(), SignalingError> {
        let message = WireMessage::Signal {
            from: None,
            from_public_key: None,
            to: Some(to.to_string()),
            to_public_key: Some(to.to_string()),
            payload: WirePayload { kind, data },
        };
        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::Serialization(e.to_string()))?;

        let sender = self.outbound.lock().clone();
        let sender = sender.ok_or(SignalingError::NotConnected)?;
        sender
            .send(text)
            .map_err(|_| SignalingError::NotConnected)?;
        debug!("Queued {} to {} on signaling socket", kind, short_id(to));
        Ok(())
    }

    fn set_listener(&self, listener: SignalListener) {
        self.slot.set(listener);
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        *self.outbound.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_inbound_signal() {
        let text = r#"{"type":"signal","from":"alice","payload":{"type":"OFFER","data":"v=0"}}"#;
        let env = decode_inbound(text, "bob").unwrap();
        assert_eq!(env.from, "alice");
        assert_eq!(env.to, "bob");
        assert_eq!(env.kind, SignalKind::Offer);
        assert_eq!(env.data, "v=0");
    }

    #[test]
    fn test_decode_inbound_falls_back_to_public_key() {
        let text =
            r#"{"type":"signal","fromPublicKey":"abcd","payload":{"type":"CONNECT_ACCEPT"}}"#;
        let env = decode_inbound(text, "bob").unwrap();
        assert_eq!(env.from, "abcd");
    }

    #[test]
    fn test_decode_inbound_rejects_other_messages() {
        assert!(decode_inbound(r#"{"type":"register","peerId":"x","publicKey":"y"}"#, "b").is_none());
        assert!(decode_inbound(r#"{"type":"signal","payload":{"type":"OFFER"}}"#, "b").is_none());
        assert!(decode_inbound("garbage", "b").is_none());
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = WireMessage::Signal {
            from: None,
            from_public_key: None,
            to: Some("bob".into()),
            to_public_key: Some("bob".into()),
            payload: WirePayload {
                kind: SignalKind::Candidate,
                data: "{}".into(),
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["type"], "signal");
        assert_eq!(json["toPublicKey"], "bob");
        assert_eq!(json["payload"]["type"], "CANDIDATE");
        assert!(json.get("from").is_none());
    }

    #[test]
    fn test_normalize_ws_url() {
        assert_eq!(normalize_ws_url("https://sig.example"), "wss://sig.example");
        assert_eq!(normalize_ws_url("http://sig.example"), "ws://sig.example");
        assert_eq!(normalize_ws_url("ws://sig.example"), "ws://sig.example");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let client = WebSocketSignaling::new("ws://127.0.0.1:9", "me", "pk", Duration::from_secs(5));
        assert!(matches!(
            client.send(SignalKind::Offer, "peer", String::new()).await,
            Err(SignalingError::NotConnected)
        ));
    }
}
