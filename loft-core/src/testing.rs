//! In-memory link between two coordinators with scriptable loss, latency and failures.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::compressor::{Deflate, PayloadCompressor};
use crate::config::TransferConfig;
use crate::coordinator::TransferCoordinator;
use crate::error::TransportError;
use crate::id::{PeerId, TransferId};
use crate::progress::{ChannelSink, ProgressEvent};
use crate::protocol::Message;
use crate::transport::{
    DrainCallback, InstallSink, MessageTransport, PayloadSource, StreamTransport,
};

const STREAM_CHUNK: usize = 16 * 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub(crate) struct LinkOptions {
    /// Probability that a oneway fragment vanishes.
    pub fragment_loss: f64,
    pub seed: u64,
    /// One-way delay for every message.
    pub latency: Duration,
    /// Answer every checkup with this count instead of asking the receiver.
    pub checkup_override: Option<i64>,
    pub drop_checkups: bool,
    /// The link dies when this many fragments have gone out.
    pub disconnect_after_fragments: Option<u32>,
    pub streams: bool,
    pub stream_open_fails: bool,
    /// Stream write fails once this many bytes are through.
    pub stream_cut_after: Option<usize>,
    pub stream_write_delay: Duration,
    pub drop_keepalives: bool,
    pub loopback: bool,
    pub max_message_size: usize,
    /// Blocking delay of the sender's payload source.
    pub source_delay: Duration,
    pub config: TransferConfig,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            fragment_loss: 0.0,
            seed: 1,
            latency: Duration::ZERO,
            checkup_override: None,
            drop_checkups: false,
            disconnect_after_fragments: None,
            streams: false,
            stream_open_fails: false,
            stream_cut_after: None,
            stream_write_delay: Duration::ZERO,
            drop_keepalives: false,
            loopback: false,
            max_message_size: 64 * 1024,
            source_delay: Duration::ZERO,
            config: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkStats {
    pub fragments: u32,
    pub dropped: u32,
    pub announces: u32,
    pub stream_writes: u32,
    pub keepalives: u32,
}

struct Shared {
    options: LinkOptions,
    rng: Mutex<StdRng>,
    alive: AtomicBool,
    stats: Mutex<LinkStats>,
    checkups: Mutex<Vec<(u32, u32)>>,
}

/// One direction of the link. Messages go straight into the far coordinator.
pub(crate) struct Endpoint {
    local: PeerId,
    remote: PeerId,
    shared: Arc<Shared>,
    far: OnceLock<Weak<TransferCoordinator>>,
}

impl Endpoint {
    fn reachable(&self, peer: PeerId) -> Result<Arc<TransferCoordinator>, TransportError> {
        if peer != self.remote || !self.shared.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.far
            .get()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::Disconnected)
    }

    /// Count a fragment and decide its fate. `Ok(false)` means it was lost.
    fn pass_fragment(&self) -> Result<bool, TransportError> {
        let options = &self.shared.options;
        let mut stats = lock(&self.shared.stats);
        stats.fragments += 1;
        if options
            .disconnect_after_fragments
            .is_some_and(|limit| stats.fragments > limit)
        {
            self.shared.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Disconnected);
        }
        if options.fragment_loss > 0.0 && lock(&self.shared.rng).gen_bool(options.fragment_loss) {
            stats.dropped += 1;
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl MessageTransport for Endpoint {
    fn max_message_size(&self) -> usize {
        self.shared.options.max_message_size
    }

    fn is_alive(&self, peer: PeerId) -> bool {
        peer == self.remote && self.shared.alive.load(Ordering::SeqCst)
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        if peer != self.remote {
            return None;
        }
        let ip = if self.shared.options.loopback {
            [127, 0, 0, 1]
        } else {
            [10, 0, 0, 2]
        };
        Some(SocketAddr::from((ip, 7400)))
    }

    async fn send(&self, peer: PeerId, message: Message) -> Result<(), TransportError> {
        let far = self.reachable(peer)?;
        if matches!(message, Message::Fragment { .. }) && !self.pass_fragment()? {
            return Ok(());
        }
        let from = self.local;
        let latency = self.shared.options.latency;
        if latency.is_zero() {
            far.handle_message(from, message);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                far.handle_message(from, message);
            });
        }
        Ok(())
    }

    async fn request(
        &self,
        peer: PeerId,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let far = self.reachable(peer)?;
        let options = &self.shared.options;
        match &message {
            Message::Checkup {
                transfer_id,
                range_start,
                range_end,
            } => {
                lock(&self.shared.checkups).push((*range_start, *range_end));
                if options.drop_checkups {
                    tokio::time::sleep(timeout).await;
                    return Err(TransportError::Timeout);
                }
                if let Some(missing) = options.checkup_override {
                    return Ok(Message::CheckupReply {
                        transfer_id: *transfer_id,
                        missing,
                    });
                }
            }
            Message::KeepAlive { .. } => {
                lock(&self.shared.stats).keepalives += 1;
                if options.drop_keepalives {
                    tokio::time::sleep(timeout).await;
                    return Err(TransportError::Timeout);
                }
            }
            Message::Announce { .. } => lock(&self.shared.stats).announces += 1,
            _ => {}
        }
        let from = self.local;
        let latency = options.latency;
        let exchange = async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let reply = far.handle_message(from, message);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            reply
        };
        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::Rejected("no reply".into())),
        }
    }
}

#[async_trait]
impl StreamTransport for Endpoint {
    fn supports(&self, peer: PeerId) -> bool {
        self.shared.options.streams && peer == self.remote
    }

    async fn open(&self, peer: PeerId) -> Result<(), TransportError> {
        self.reachable(peer)?;
        if self.shared.options.stream_open_fails {
            return Err(TransportError::Rejected("stream listener refused".into()));
        }
        Ok(())
    }

    async fn write_all(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        bytes: &[u8],
        on_drain: DrainCallback<'_>,
    ) -> Result<(), TransportError> {
        let far = self.reachable(peer)?;
        lock(&self.shared.stats).stream_writes += 1;
        let options = &self.shared.options;
        if !options.stream_write_delay.is_zero() {
            tokio::time::sleep(options.stream_write_delay).await;
        }
        let total = bytes.len() as u64;
        let mut sent = 0usize;
        for chunk in bytes.chunks(STREAM_CHUNK) {
            if options.stream_cut_after.is_some_and(|cut| sent >= cut) {
                return Err(TransportError::Disconnected);
            }
            far.on_stream_data(self.local, transfer_id, chunk)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            sent += chunk.len();
            on_drain(sent as u64, total);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

pub(crate) struct MemorySource {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    delay: Duration,
}

impl MemorySource {
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        lock(&self.entries).insert(key.to_string(), bytes);
    }
}

impl PayloadSource for MemorySource {
    fn gather(&self, key: &str) -> std::io::Result<Vec<u8>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        lock(&self.entries).get(key).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no snapshot named {}", key),
            )
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    installs: Mutex<Vec<(String, Vec<u8>)>>,
}

impl InstallSink for RecordingSink {
    fn install(&self, logical_name: &str, bytes: Vec<u8>) -> std::io::Result<()> {
        lock(&self.installs).push((logical_name.to_string(), bytes));
        Ok(())
    }
}

/// Node A serves payloads from `source`; node B records what it installs.
pub(crate) struct Link {
    pub a: Arc<TransferCoordinator>,
    pub b: Arc<TransferCoordinator>,
    /// A's endpoint towards B, usable directly as either transport.
    pub sender: Arc<Endpoint>,
    pub sender_id: PeerId,
    pub receiver_id: PeerId,
    pub source: Arc<MemorySource>,
    installs: Arc<RecordingSink>,
    events_a: Mutex<UnboundedReceiver<ProgressEvent>>,
    events_b: Mutex<UnboundedReceiver<ProgressEvent>>,
    shared: Arc<Shared>,
}

impl Link {
    pub fn installed(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.installs.installs).clone()
    }

    /// Installs run on a blocking worker after the last byte lands.
    pub async fn wait_installs(&self, n: usize) -> Vec<(String, Vec<u8>)> {
        for _ in 0..1000 {
            let installed = self.installed();
            if installed.len() >= n {
                return installed;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.installed()
    }

    pub fn checkup_ranges(&self) -> Vec<(u32, u32)> {
        lock(&self.shared.checkups).clone()
    }

    pub fn stats(&self) -> LinkStats {
        *lock(&self.shared.stats)
    }

    pub fn events_a(&self) -> Vec<ProgressEvent> {
        drain(&self.events_a)
    }

    pub fn events_b(&self) -> Vec<ProgressEvent> {
        drain(&self.events_b)
    }

    /// First event from B matching `pred`, polling for a while.
    pub async fn wait_event_b(
        &self,
        pred: impl Fn(&ProgressEvent) -> bool,
    ) -> Option<ProgressEvent> {
        for _ in 0..1000 {
            if let Some(found) = self.events_b().into_iter().find(|e| pred(e)) {
                return Some(found);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }
}

fn drain(rx: &Mutex<UnboundedReceiver<ProgressEvent>>) -> Vec<ProgressEvent> {
    let mut rx = lock(rx);
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub(crate) fn pair(options: LinkOptions) -> Link {
    let sender_id = PeerId::generate();
    let receiver_id = PeerId::generate();
    let config = options.config.clone();
    let source = Arc::new(MemorySource {
        entries: Mutex::new(HashMap::new()),
        delay: options.source_delay,
    });
    let shared = Arc::new(Shared {
        rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
        alive: AtomicBool::new(true),
        stats: Mutex::new(LinkStats::default()),
        checkups: Mutex::new(Vec::new()),
        options,
    });
    let to_b = Arc::new(Endpoint {
        local: sender_id,
        remote: receiver_id,
        shared: shared.clone(),
        far: OnceLock::new(),
    });
    let to_a = Arc::new(Endpoint {
        local: receiver_id,
        remote: sender_id,
        shared: shared.clone(),
        far: OnceLock::new(),
    });

    let installs = Arc::new(RecordingSink::default());
    let (sink_a, events_a) = ChannelSink::new();
    let (sink_b, events_b) = ChannelSink::new();
    let compressor = PayloadCompressor::new(
        source.clone(),
        Arc::new(Deflate::default()),
        config.compress,
    );
    let a = Arc::new(
        TransferCoordinator::new(config.clone(), to_b.clone())
            .with_streams(to_b.clone())
            .with_compressor(Arc::new(compressor))
            .with_progress_sink(Arc::new(sink_a)),
    );
    let b = Arc::new(
        TransferCoordinator::new(config, to_a.clone())
            .with_streams(to_a.clone())
            .with_install_sink(installs.clone())
            .with_progress_sink(Arc::new(sink_b)),
    );
    let _ = to_b.far.set(Arc::downgrade(&b));
    let _ = to_a.far.set(Arc::downgrade(&a));

    Link {
        a,
        b,
        sender: to_b,
        sender_id,
        receiver_id,
        source,
        installs,
        events_a: Mutex::new(events_a),
        events_b: Mutex::new(events_b),
        shared,
    }
}
