//! TCP transports: one framed control connection per peer (hello exchange, then envelopes),
//! and a dedicated connection per stream transfer (preamble, then raw payload bytes).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use loft_core::wire::{self, FrameEncodeError, LEN_SIZE};
use loft_core::{
    decode_frame, encode_frame, DrainCallback, Envelope, EnvelopeKind, Message, MessageTransport,
    PeerId, StreamPreamble, StreamTransport, TransferCoordinator, TransferId, TransportError,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_CHUNK: usize = 256 * 1024;

/// Largest control message the node sends. Fragments are sized to fit.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PeerLink {
    generation: u64,
    addr: SocketAddr,
    stream_port: Option<u16>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
}

/// Every connection of this node. Implements both core transports.
pub struct Network {
    node_id: PeerId,
    stream_port: Option<u16>,
    peers: Mutex<HashMap<PeerId, PeerLink>>,
    /// Stream connections opened ahead of their write.
    streams: Mutex<HashMap<PeerId, TcpStream>>,
    next_seq: AtomicU64,
    next_generation: AtomicU64,
    stream_dials: AtomicU64,
    coordinator: OnceLock<Weak<TransferCoordinator>>,
}

impl Network {
    pub fn new(node_id: PeerId, stream_port: Option<u16>) -> Self {
        Self {
            node_id,
            stream_port,
            peers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            next_generation: AtomicU64::new(0),
            stream_dials: AtomicU64::new(0),
            coordinator: OnceLock::new(),
        }
    }

    pub fn node_id(&self) -> PeerId {
        self.node_id
    }

    /// Inbound messages go to `coordinator`. Set once, before any connection.
    pub fn attach_coordinator(&self, coordinator: &Arc<TransferCoordinator>) {
        let _ = self.coordinator.set(Arc::downgrade(coordinator));
    }

    fn coordinator(&self) -> Option<Arc<TransferCoordinator>> {
        self.coordinator.get().and_then(Weak::upgrade)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.peers).keys().copied().collect()
    }

    /// Stream connections dialed so far. Each is kept and reused while the peer holds it open.
    pub fn stream_dials(&self) -> u64 {
        self.stream_dials.load(Ordering::Relaxed)
    }

    /// Dial a peer's control port and complete the hello exchange.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<PeerId> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        let (peer, stream_port) = self.handshake(&mut stream).await?;
        self.attach(stream, addr, peer, stream_port);
        Ok(peer)
    }

    pub async fn run_control_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((mut stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        match this.handshake(&mut stream).await {
                            Ok((peer, stream_port)) => this.attach(stream, addr, peer, stream_port),
                            Err(e) => warn!(%addr, error = %e, "handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control listener stopped");
                    break;
                }
            }
        }
    }

    pub async fn run_stream_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.receive_stream(stream, addr).await {
                            warn!(%addr, error = %e, "stream connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "stream listener stopped");
                    break;
                }
            }
        }
    }

    async fn handshake(&self, stream: &mut TcpStream) -> anyhow::Result<(PeerId, Option<u16>)> {
        let hello = Envelope {
            seq: 0,
            kind: EnvelopeKind::Oneway,
            message: Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                node_id: self.node_id,
                stream_port: self.stream_port,
            },
        };
        stream.write_all(&encode_frame(&hello)?).await?;
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
            .await
            .context("handshake timed out")??;
        let frame = frame.context("peer closed during handshake")?;
        let (envelope, _) = decode_frame(&frame)?;
        match envelope.message {
            Message::Hello {
                protocol_version,
                node_id,
                stream_port,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    bail!("unsupported protocol version {}", protocol_version);
                }
                Ok((node_id, stream_port))
            }
            other => bail!("expected hello, got {}", other.name()),
        }
    }

    fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        peer: PeerId,
        stream_port: Option<u16>,
    ) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let link = PeerLink {
            generation,
            addr,
            stream_port,
            tx,
            pending: pending.clone(),
        };
        if lock(&self.peers).insert(peer, link).is_some() {
            info!(peer = %peer, "replacing existing connection");
        }
        info!(peer = %peer, %addr, streams = stream_port.is_some(), "peer connected");
        tokio::spawn(write_loop(writer, rx));
        let this = self.clone();
        tokio::spawn(async move {
            this.read_loop(reader, peer, generation, pending).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        peer: PeerId,
        generation: u64,
        pending: Pending,
    ) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "control read failed");
                    break;
                }
            };
            match decode_frame(&frame) {
                Ok((envelope, _)) => self.dispatch(peer, &pending, envelope),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "undecodable frame, dropping connection");
                    break;
                }
            }
        }
        self.detach(peer, generation, &pending);
    }

    fn dispatch(&self, peer: PeerId, pending: &Pending, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Reply { to } => {
                let waiter = lock(pending).remove(&to);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(envelope.message);
                    }
                    None => debug!(peer = %peer, seq = to, "late reply dropped"),
                }
            }
            kind => {
                let Some(coordinator) = self.coordinator() else {
                    return;
                };
                let reply = coordinator.handle_message(peer, envelope.message);
                if kind != EnvelopeKind::Request {
                    return;
                }
                if let Some(reply) = reply {
                    let sent = self.link(peer).and_then(|(tx, _)| {
                        let kind = EnvelopeKind::Reply { to: envelope.seq };
                        let frame = frame(self.next_seq(), kind, reply)?;
                        tx.send(frame).map_err(|_| TransportError::Disconnected)
                    });
                    if let Err(e) = sent {
                        debug!(peer = %peer, error = %e, "reply not sent");
                    }
                }
            }
        }
    }

    /// Connection gone: fail outstanding requests, then tell the coordinator. A newer
    /// connection to the same peer is left alone.
    fn detach(&self, peer: PeerId, generation: u64, pending: &Pending) {
        let removed = {
            let mut peers = lock(&self.peers);
            if peers
                .get(&peer)
                .is_some_and(|link| link.generation == generation)
            {
                peers.remove(&peer);
                true
            } else {
                false
            }
        };
        lock(pending).clear();
        if removed {
            lock(&self.streams).remove(&peer);
            warn!(peer = %peer, "peer disconnected");
            if let Some(coordinator) = self.coordinator() {
                coordinator.on_peer_disconnected(peer);
            }
        }
    }

    fn link(
        &self,
        peer: PeerId,
    ) -> Result<(mpsc::UnboundedSender<Vec<u8>>, Pending), TransportError> {
        lock(&self.peers)
            .get(&peer)
            .map(|link| (link.tx.clone(), link.pending.clone()))
            .ok_or(TransportError::Disconnected)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Serve one stream connection: any number of preamble + body pairs, until the sender
    /// closes it between payloads.
    async fn receive_stream(&self, mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            let Some(frame) = read_frame(&mut stream).await? else {
                debug!(%addr, "stream connection closed");
                return Ok(());
            };
            let (preamble, _) = wire::decode_preamble(&frame)?;
            let known = lock(&self.peers)
                .get(&preamble.node_id)
                .is_some_and(|link| link.addr.ip() == addr.ip());
            if !known {
                bail!("stream from {} claims unknown node {}", addr, preamble.node_id);
            }
            let coordinator = self.coordinator().context("node is shutting down")?;
            let total = preamble.total_length;
            let mut received = 0u64;
            while received < total {
                let want = (total - received).min(buf.len() as u64) as usize;
                let n = stream.read(&mut buf[..want]).await?;
                if n == 0 {
                    bail!("stream closed after {} of {} bytes", received, total);
                }
                coordinator.on_stream_data(preamble.node_id, preamble.transfer_id, &buf[..n])?;
                received += n as u64;
            }
            debug!(
                peer = %preamble.node_id,
                transfer = %preamble.transfer_id,
                bytes = total,
                "stream payload drained"
            );
        }
    }
}

#[async_trait]
impl MessageTransport for Network {
    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    fn is_alive(&self, peer: PeerId) -> bool {
        lock(&self.peers)
            .get(&peer)
            .is_some_and(|link| !link.tx.is_closed())
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        lock(&self.peers).get(&peer).map(|link| link.addr)
    }

    async fn send(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        let (tx, _) = self.link(peer)?;
        let frame = frame(self.next_seq(), EnvelopeKind::Oneway, message)?;
        tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    async fn request(
        &self,
        peer: PeerId,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let (tx, pending) = self.link(peer)?;
        let seq = self.next_seq();
        let frame = frame(seq, EnvelopeKind::Request, message)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&pending).insert(seq, reply_tx);
        if tx.send(frame).is_err() {
            lock(&pending).remove(&seq);
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                lock(&pending).remove(&seq);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl StreamTransport for Network {
    fn supports(&self, peer: PeerId) -> bool {
        lock(&self.peers)
            .get(&peer)
            .is_some_and(|link| link.stream_port.is_some())
    }

    /// Reuse the kept connection if the peer still holds it open; otherwise dial anew.
    async fn open(&self, peer: PeerId) -> Result<(), TransportError> {
        let target = {
            let peers = lock(&self.peers);
            let link = peers.get(&peer).ok_or(TransportError::Disconnected)?;
            let port = link
                .stream_port
                .ok_or_else(|| TransportError::Rejected("peer has no stream listener".into()))?;
            SocketAddr::new(link.addr.ip(), port)
        };
        let stale = lock(&self.streams).remove(&peer);
        if let Some(existing) = stale {
            let mut probe = [0u8; 1];
            let idle = matches!(
                existing.try_read(&mut probe),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock
            );
            if idle {
                lock(&self.streams).insert(peer, existing);
                return Ok(());
            }
        }
        let stream = TcpStream::connect(target).await.map_err(io_error)?;
        let _ = stream.set_nodelay(true);
        self.stream_dials.fetch_add(1, Ordering::Relaxed);
        lock(&self.streams).insert(peer, stream);
        debug!(peer = %peer, %target, "stream connection opened");
        Ok(())
    }

    async fn write_all(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        bytes: &[u8],
        on_drain: DrainCallback<'_>,
    ) -> Result<(), TransportError> {
        let opened = lock(&self.streams).remove(&peer);
        let mut stream = match opened {
            Some(stream) => stream,
            None => {
                self.open(peer).await?;
                let reopened = lock(&self.streams).remove(&peer);
                reopened.ok_or(TransportError::Disconnected)?
            }
        };
        let preamble = wire::encode_preamble(&StreamPreamble {
            node_id: self.node_id,
            transfer_id,
            total_length: bytes.len() as u64,
        })
        .map_err(encode_error)?;
        stream.write_all(&preamble).await.map_err(io_error)?;
        let total = bytes.len() as u64;
        let mut sent = 0u64;
        for chunk in bytes.chunks(STREAM_CHUNK) {
            stream.write_all(chunk).await.map_err(io_error)?;
            sent += chunk.len() as u64;
            on_drain(sent, total);
        }
        stream.flush().await.map_err(io_error)?;
        // Back for the next payload; a connection that failed mid-write is dropped instead.
        lock(&self.streams).entry(peer).or_insert(stream);
        Ok(())
    }
}

fn frame(seq: u64, kind: EnvelopeKind, message: Message) -> Result<Vec<u8>, TransportError> {
    encode_frame(&Envelope { seq, kind, message }).map_err(encode_error)
}

fn encode_error(e: FrameEncodeError) -> TransportError {
    match e {
        FrameEncodeError::TooLarge => TransportError::TooLarge,
        other => TransportError::Io(other.to_string()),
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof => TransportError::Disconnected,
        ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::Io(e.to_string()),
    }
}

/// One length-prefixed frame, prefix included. `None` on a clean close between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = wire::frame_len(&len_buf)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
    let mut frame = vec![0u8; LEN_SIZE + len];
    frame[..LEN_SIZE].copy_from_slice(&len_buf);
    reader.read_exact(&mut frame[LEN_SIZE..]).await?;
    Ok(Some(frame))
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
}
