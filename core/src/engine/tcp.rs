// LAN-only engine over a single direct TCP stream
//
// SDP:   offer  = "tcp <listen addr> <token>"   (offerer listens)
//        answer = "tcp - <token>"               (answerer dials)
//
// Frame: u32 BE length | u8 kind | u8 label len | label | payload
// The dialer opens with a HELLO frame carrying the offer token; the offerer
// then announces each of its channels with an OPEN frame.

use super::{
    ChannelPayload, DataChannel, EngineError, EngineEvent, EventSink, IceState, PeerConnection,
    PeerConnectionFactory, SdpKind, SessionDescription,
};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

const KIND_HELLO: u8 = 0;
const KIND_OPEN: u8 = 1;
const KIND_TEXT: u8 = 2;
const KIND_BINARY: u8 = 3;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

type FrameWriter = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

pub struct TcpEngine {
    advertise_ip: IpAddr,
}

impl TcpEngine {
    /// `advertise_ip` is the address peers on the LAN can reach us at
    pub fn new(advertise_ip: IpAddr) -> Arc<Self> {
        Arc::new(Self { advertise_ip })
    }
}

impl PeerConnectionFactory for TcpEngine {
    fn create(
        &self,
        _peer_id: &str,
        events: EventSink,
    ) -> Result<Arc<dyn PeerConnection>, EngineError> {
        Ok(Arc::new(TcpPeerConnection {
            advertise_ip: self.advertise_ip,
            token: Uuid::new_v4().simple().to_string(),
            events,
            channels: Arc::new(Mutex::new(HashMap::new())),
            writer: Arc::new(Mutex::new(None)),
            buffered: Arc::new(AtomicU64::new(0)),
            listener: Mutex::new(None),
            remote: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct RemoteDescription {
    kind: SdpKind,
    addr: Option<SocketAddr>,
    token: String,
}

fn parse_sdp(desc: &SessionDescription) -> Result<RemoteDescription, EngineError> {
    let invalid = || EngineError::InvalidDescription(desc.sdp.clone());
    let mut parts = desc.sdp.split_whitespace();
    if parts.next() != Some("tcp") {
        return Err(invalid());
    }
    let addr = match parts.next().ok_or_else(invalid)? {
        "-" => None,
        addr => Some(addr.parse().map_err(|_| invalid())?),
    };
    let token = parts.next().ok_or_else(invalid)?.to_string();
    if desc.kind == SdpKind::Offer && addr.is_none() {
        return Err(invalid());
    }
    Ok(RemoteDescription {
        kind: desc.kind,
        addr,
        token,
    })
}

fn encode_frame(kind: u8, label: &str, payload: &[u8]) -> Vec<u8> {
    let label = &label.as_bytes()[..label.len().min(u8::MAX as usize)];
    let body_len = 2 + label.len() + payload.len();
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.push(kind);
    frame.push(label.len() as u8);
    frame.extend_from_slice(label);
    frame.extend_from_slice(payload);
    frame
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<(u8, String, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if !(2..=MAX_FRAME_LEN).contains(&len) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad frame length",
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let kind = body[0];
    let label_len = body[1] as usize;
    if 2 + label_len > body.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad label length",
        ));
    }
    let label = String::from_utf8_lossy(&body[2..2 + label_len]).into_owned();
    let payload = body[2 + label_len..].to_vec();
    Ok((kind, label, payload))
}

pub struct TcpPeerConnection {
    advertise_ip: IpAddr,
    token: String,
    events: EventSink,
    channels: Arc<Mutex<HashMap<String, Arc<TcpDataChannel>>>>,
    writer: FrameWriter,
    buffered: Arc<AtomicU64>,
    listener: Mutex<Option<TcpListener>>,
    remote: Mutex<Option<RemoteDescription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

/// State shared by the IO tasks of one connection
#[derive(Clone)]
struct Link {
    events: EventSink,
    channels: Arc<Mutex<HashMap<String, Arc<TcpDataChannel>>>>,
    writer: FrameWriter,
    buffered: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl Link {
    /// Run the connected stream until it ends
    async fn run(self, stream: TcpStream, is_offerer: bool) {
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.lock() = Some(tx.clone());
        let writer_task = tokio::spawn(write_loop(writer, rx, self.buffered.clone()));

        self.events
            .emit(EngineEvent::StateChanged(IceState::Connected));

        if is_offerer {
            let channels: Vec<Arc<TcpDataChannel>> =
                self.channels.lock().values().cloned().collect();
            for channel in channels {
                let _ = tx.send(encode_frame(KIND_OPEN, &channel.label, &[]));
                channel.open.store(true, Ordering::SeqCst);
                self.events
                    .emit(EngineEvent::ChannelOpen(channel.label.clone()));
            }
        }

        loop {
            match read_frame(&mut reader).await {
                Ok((KIND_OPEN, label, _)) => {
                    let channel = Arc::new(TcpDataChannel::new(
                        &label,
                        self.writer.clone(),
                        self.buffered.clone(),
                    ));
                    channel.open.store(true, Ordering::SeqCst);
                    self.channels.lock().insert(label.clone(), channel.clone());
                    self.events.emit(EngineEvent::DataChannel(channel));
                    self.events.emit(EngineEvent::ChannelOpen(label));
                }
                Ok((KIND_TEXT, label, payload)) => match String::from_utf8(payload) {
                    Ok(text) => self.events.emit(EngineEvent::Message {
                        label,
                        payload: ChannelPayload::Text(text),
                    }),
                    Err(_) => debug!("Dropping non-UTF-8 text frame on {}", label),
                },
                Ok((KIND_BINARY, label, payload)) => self.events.emit(EngineEvent::Message {
                    label,
                    payload: ChannelPayload::Binary(payload),
                }),
                Ok((kind, _, _)) => debug!("Ignoring frame kind {}", kind),
                Err(e) => {
                    debug!("TCP link ended: {}", e);
                    break;
                }
            }
        }

        writer_task.abort();
        *self.writer.lock() = None;
        for channel in self.channels.lock().values() {
            channel.open.store(false, Ordering::SeqCst);
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.events
                .emit(EngineEvent::StateChanged(IceState::Disconnected));
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicU64>,
) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len() as u64;
        let result = writer.write_all(&frame).await;
        buffered.fetch_sub(len.min(buffered.load(Ordering::SeqCst)), Ordering::SeqCst);
        if let Err(e) = result {
            debug!("TCP write failed: {}", e);
            return;
        }
    }
}

impl TcpPeerConnection {
    fn link(&self) -> Link {
        Link {
            events: self.events.clone(),
            channels: self.channels.clone(),
            writer: self.writer.clone(),
            buffered: self.buffered.clone(),
            closed: self.closed.clone(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn spawn_accept(&self, listener: TcpListener) {
        let link = self.link();
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                let (mut reader, writer) = stream.into_split();
                match read_frame(&mut reader).await {
                    Ok((KIND_HELLO, _, payload)) if payload == token.as_bytes() => {
                        let stream = match reader.reunite(writer) {
                            Ok(stream) => stream,
                            Err(_) => return,
                        };
                        link.run(stream, true).await;
                        return;
                    }
                    _ => debug!("Rejected TCP dial from {} with wrong token", peer),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_dial(&self, addr: SocketAddr, token: String) {
        let link = self.link();
        let handle = tokio::spawn(async move {
            let mut stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TCP dial to {} failed: {}", addr, e);
                    link.events.emit(EngineEvent::StateChanged(IceState::Failed));
                    return;
                }
            };
            if stream
                .write_all(&encode_frame(KIND_HELLO, "", token.as_bytes()))
                .await
                .is_err()
            {
                link.events.emit(EngineEvent::StateChanged(IceState::Failed));
                return;
            }
            link.run(stream, false).await;
        });
        self.tasks.lock().push(handle);
    }
}

#[async_trait]
impl PeerConnection for TcpPeerConnection {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let channel = Arc::new(TcpDataChannel::new(
            label,
            self.writer.clone(),
            self.buffered.clone(),
        ));
        self.channels
            .lock()
            .insert(label.to_string(), channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let listener = TcpListener::bind(SocketAddr::new(self.advertise_ip, 0))
            .await
            .map_err(|e| EngineError::Io(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| EngineError::Io(e.to_string()))?;
        *self.listener.lock() = Some(listener);
        Ok(SessionDescription::offer(format!("tcp {} {}", addr, self.token)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if !self.has_remote_description() {
            return Err(EngineError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!("tcp - {}", self.token)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        match desc.kind {
            SdpKind::Offer => {
                let listener = self
                    .listener
                    .lock()
                    .take()
                    .ok_or_else(|| EngineError::InvalidDescription(desc.sdp.clone()))?;
                self.spawn_accept(listener);
            }
            SdpKind::Answer => {
                let target = {
                    let remote = self.remote.lock();
                    let remote = remote.as_ref().ok_or(EngineError::NoRemoteDescription)?;
                    remote.addr.map(|addr| (addr, remote.token.clone()))
                };
                let (addr, token) =
                    target.ok_or_else(|| EngineError::InvalidDescription(desc.sdp.clone()))?;
                self.spawn_dial(addr, token);
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let remote = parse_sdp(&desc)?;
        *self.remote.lock() = Some(remote);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote.lock().is_some()
    }

    fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
        // The address travels in the SDP; nothing to gather.
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.writer.lock() = None;
        for channel in self.channels.lock().values() {
            channel.open.store(false, Ordering::SeqCst);
        }
        self.events.emit(EngineEvent::StateChanged(IceState::Closed));
    }
}

pub struct TcpDataChannel {
    label: String,
    open: AtomicBool,
    writer: FrameWriter,
    buffered: Arc<AtomicU64>,
}

impl TcpDataChannel {
    fn new(label: &str, writer: FrameWriter, buffered: Arc<AtomicU64>) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            writer,
            buffered,
        }
    }

    fn send_frame(&self, kind: u8, payload: &[u8]) -> Result<(), EngineError> {
        if !self.is_open() {
            return Err(EngineError::ChannelNotOpen(self.label.clone()));
        }
        let frame = encode_frame(kind, &self.label, payload);
        let len = frame.len() as u64;
        let sender = self
            .writer
            .lock()
            .clone()
            .ok_or_else(|| EngineError::ChannelNotOpen(self.label.clone()))?;
        self.buffered.fetch_add(len, Ordering::SeqCst);
        sender.send(frame).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            EngineError::ChannelNotOpen(self.label.clone())
        })
    }
}

impl DataChannel for TcpDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: &str) -> Result<(), EngineError> {
        self.send_frame(KIND_TEXT, text.as_bytes())
    }

    fn send_binary(&self, data: &[u8]) -> Result<(), EngineError> {
        self.send_frame(KIND_BINARY, data)
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
