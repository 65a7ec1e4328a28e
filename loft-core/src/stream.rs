//! Stream delivery: one offer on the message transport, the whole payload as a single write on
//! the dedicated stream, keepalives on the message transport while the write is outstanding,
//! then a report poll until the receiver confirms it holds every byte. No retries: the
//! coordinator decides what a failure means.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compressor::Payload;
use crate::config::TransferConfig;
use crate::error::{TransferError, TransportError};
use crate::id::{PeerId, TransferId};
use crate::protocol::Message;
use crate::session::cancellable;
use crate::transport::{DrainCallback, MessageTransport, StreamTransport};

pub struct StreamChannel<'a> {
    messages: &'a dyn MessageTransport,
    streams: &'a dyn StreamTransport,
    config: &'a TransferConfig,
}

impl<'a> StreamChannel<'a> {
    pub fn new(
        messages: &'a dyn MessageTransport,
        streams: &'a dyn StreamTransport,
        config: &'a TransferConfig,
    ) -> Self {
        Self {
            messages,
            streams,
            config,
        }
    }

    /// Open or reuse the dedicated connection within the configured bounded wait.
    pub async fn open(&self, peer: PeerId) -> Result<(), TransferError> {
        if !self.streams.supports(peer) {
            return Err(TransferError::NegotiationFailure(
                "peer has no stream listener".into(),
            ));
        }
        match tokio::time::timeout(self.config.stream_open_wait(), self.streams.open(peer)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::Disconnected)) => Err(TransferError::Disconnected),
            Ok(Err(e)) => Err(TransferError::NegotiationFailure(format!(
                "stream open failed: {}",
                e
            ))),
            Err(_) => Err(TransferError::NegotiationFailure(
                "stream open timed out".into(),
            )),
        }
    }

    /// Deliver `payload`. `timeout` bounds silence from the peer: it restarts on every
    /// keepalive answer and every report that shows new bytes.
    ///
    /// A write already handed to the stream is not interrupted by `cancel`; cancellation is
    /// observed before the offer and after the write.
    pub async fn send(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        payload: &Payload,
        timeout: Duration,
        cancel: &CancellationToken,
        on_drain: DrainCallback<'_>,
    ) -> Result<(), TransferError> {
        if !self.messages.is_alive(peer) {
            return Err(TransferError::Disconnected);
        }
        cancellable(cancel, self.open(peer)).await??;

        let token: u64 = rand::random();
        self.offer(peer, transfer_id, payload, token, cancel).await?;
        info!(
            peer = %peer,
            transfer = %transfer_id,
            bytes = payload.total_length(),
            "stream offer accepted"
        );

        let write = self
            .streams
            .write_all(peer, transfer_id, payload.bytes(), on_drain);
        tokio::select! {
            written = write => {
                written.map_err(|e| TransferError::from_transfer(e, "stream write"))?
            }
            err = self.keepalive(peer, token, timeout) => return Err(err),
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        self.await_report(peer, transfer_id, payload.total_length(), timeout, cancel)
            .await?;
        info!(peer = %peer, transfer = %transfer_id, "stream transfer complete");
        Ok(())
    }

    async fn offer(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        payload: &Payload,
        keepalive_token: u64,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let msg = Message::StreamOffer {
            transfer_id,
            logical_name: payload.logical_name().to_string(),
            total_length: payload.total_length(),
            compressed: payload.is_compressed(),
            digest: *payload.digest(),
            keepalive_token,
        };
        let reply = cancellable(
            cancel,
            self.messages
                .request(peer, msg, self.config.request_timeout()),
        )
        .await?
        .map_err(TransferError::from_handshake)?;
        match reply {
            Message::Ack { .. } => Ok(()),
            Message::Reject { reason, .. } => Err(TransferError::NegotiationFailure(reason)),
            other => Err(TransferError::NegotiationFailure(format!(
                "unexpected {} in reply to stream offer",
                other.name()
            ))),
        }
    }

    /// Heartbeat until the peer stays silent longer than `timeout`. Only ever returns the
    /// failure; the caller drops it once the write finishes.
    async fn keepalive(&self, peer: PeerId, token: u64, timeout: Duration) -> TransferError {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_answer = Instant::now();
        loop {
            ticker.tick().await;
            if last_answer.elapsed() > timeout {
                warn!(peer = %peer, "no keepalive answer within stream timeout");
                return TransferError::PeerTimeout("stream keepalive");
            }
            let reply = self
                .messages
                .request(
                    peer,
                    Message::KeepAlive { token },
                    self.config.request_timeout().min(timeout),
                )
                .await;
            match reply {
                Ok(Message::KeepAliveAck { token: t }) if t == token => {
                    last_answer = Instant::now();
                }
                Ok(other) => debug!(peer = %peer, reply = other.name(), "odd keepalive reply"),
                Err(TransportError::Disconnected) => return TransferError::Disconnected,
                Err(e) => debug!(peer = %peer, error = %e, "keepalive unanswered"),
            }
        }
    }

    /// Poll the receiver until it reports the whole payload. Growth refreshes the deadline.
    async fn await_report(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        total: u64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let mut deadline = Instant::now() + timeout;
        let mut last_received = None;
        loop {
            let reply = cancellable(
                cancel,
                self.messages.request(
                    peer,
                    Message::StreamFinish { transfer_id },
                    self.config.request_timeout(),
                ),
            )
            .await?;
            match reply {
                Ok(Message::StreamReport { complete: true, .. }) => return Ok(()),
                Ok(Message::StreamReport { received, .. }) => {
                    debug!(transfer = %transfer_id, received, total, "stream report");
                    if last_received.map_or(true, |last| received > last) {
                        last_received = Some(received);
                        deadline = Instant::now() + timeout;
                    }
                }
                Ok(Message::Reject { reason, .. }) => return Err(TransferError::PeerAbort(reason)),
                Ok(other) => {
                    return Err(TransferError::PeerAbort(format!(
                        "unexpected {} in reply to stream finish",
                        other.name()
                    )))
                }
                Err(TransportError::Timeout) => {}
                Err(e) => return Err(TransferError::from_transfer(e, "stream report")),
            }
            if Instant::now() >= deadline {
                return Err(TransferError::PeerTimeout("stream report"));
            }
            cancellable(cancel, tokio::time::sleep(self.config.keepalive_interval())).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pair, LinkOptions};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn payload(len: usize) -> Payload {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        Payload::new("world", bytes, false)
    }

    fn streaming() -> LinkOptions {
        LinkOptions {
            streams: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_whole_payload_and_reports_drain() {
        let link = pair(streaming());
        let config = TransferConfig::default();
        let p = payload(100_000);
        let drained = AtomicU64::new(0);
        let on_drain = |bytes: u64, _total: u64| {
            drained.store(bytes, Ordering::SeqCst);
        };
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &p,
                config.stream_timeout(),
                &CancellationToken::new(),
                &on_drain,
            )
            .await
            .unwrap();
        assert_eq!(drained.load(Ordering::SeqCst), 100_000);
        let installed = link.wait_installs(1).await;
        assert_eq!(installed[0].1, p.bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn open_fails_without_listener() {
        let link = pair(LinkOptions::default());
        let config = TransferConfig::default();
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        let err = channel.open(link.receiver_id).await.unwrap_err();
        assert!(matches!(err, TransferError::NegotiationFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_is_negotiation_failure() {
        let link = pair(LinkOptions {
            stream_open_fails: true,
            ..streaming()
        });
        let config = TransferConfig::default();
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(10),
                config.stream_timeout(),
                &CancellationToken::new(),
                &|_: u64, _: u64| {},
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::NegotiationFailure);
        assert_eq!(link.stats().stream_writes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cut_stream_surfaces_as_disconnect() {
        let link = pair(LinkOptions {
            stream_cut_after: Some(20_000),
            ..streaming()
        });
        let config = TransferConfig::default();
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(100_000),
                config.stream_timeout(),
                &CancellationToken::new(),
                &|_: u64, _: u64| {},
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_keepalives_outlast_stream_timeout() {
        let link = pair(LinkOptions {
            stream_write_delay: Duration::from_secs(40),
            ..streaming()
        });
        let config = TransferConfig::default();
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(1_000),
                config.stream_timeout(),
                &CancellationToken::new(),
                &|_: u64, _: u64| {},
            )
            .await
            .unwrap();
        assert!(link.stats().keepalives >= 30);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_keepalives_time_out() {
        let link = pair(LinkOptions {
            stream_write_delay: Duration::from_secs(120),
            drop_keepalives: true,
            ..streaming()
        });
        let config = TransferConfig::default();
        let channel = StreamChannel::new(link.sender.as_ref(), link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(1_000),
                config.stream_timeout(),
                &CancellationToken::new(),
                &|_: u64, _: u64| {},
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::PeerTimeout("stream keepalive"));
    }
}
