//! Collaborator seams. The core never opens a socket or touches a disk itself: hosts inject
//! these and the channels drive them.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::id::{PeerId, TransferId};
use crate::protocol::Message;

/// Small-message request/response transport with a per-message size limit.
/// Delivery of `send` is best effort; `request` waits for the peer's reply.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Largest encoded message the transport carries.
    fn max_message_size(&self) -> usize;

    /// False once the peer's connection is known to be gone.
    fn is_alive(&self, peer: PeerId) -> bool;

    /// Remote address, used to detect loopback peers.
    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr>;

    /// Fire-and-forget. An `Ok` says nothing about arrival.
    async fn send(&self, peer: PeerId, message: Message) -> Result<(), TransportError>;

    /// Send and wait up to `timeout` for the reply. A `Reject` reply is returned as a
    /// message, not an error; callers decide what a rejection means at their stage.
    async fn request(
        &self,
        peer: PeerId,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    fn is_loopback(&self, peer: PeerId) -> bool {
        self.peer_addr(peer)
            .map(|addr| addr.ip().is_loopback())
            .unwrap_or(false)
    }
}

/// Progress callback invoked on buffer-drain events: `(bytes_so_far, total_bytes)`.
pub type DrainCallback<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Dedicated high-throughput byte stream to one peer.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Whether the peer advertised a stream listener.
    fn supports(&self, peer: PeerId) -> bool;

    /// Open the connection, or reuse and verify an existing one.
    async fn open(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Push the whole buffer as one logical write, reporting drain progress.
    async fn write_all(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        bytes: &[u8],
        on_drain: DrainCallback<'_>,
    ) -> Result<(), TransportError>;
}

/// Source of raw snapshot bytes. Called on a blocking worker thread.
pub trait PayloadSource: Send + Sync + 'static {
    fn gather(&self, key: &str) -> std::io::Result<Vec<u8>>;
}

/// Receives completed payloads (already decompressed). Called on a blocking worker thread.
pub trait InstallSink: Send + Sync + 'static {
    fn install(&self, logical_name: &str, bytes: Vec<u8>) -> std::io::Result<()>;
}

/// Sink that discards everything; for send-only hosts.
pub struct DiscardSink;

impl InstallSink for DiscardSink {
    fn install(&self, _logical_name: &str, _bytes: Vec<u8>) -> std::io::Result<()> {
        Ok(())
    }
}
