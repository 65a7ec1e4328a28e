//! Fragmented delivery over the small-message transport.
//!
//! Send side: probe ping, announce, push every fragment fire-and-forget with an adaptive gap,
//! pause every `interval` fragments for a checkup, then loop on completeness reports and
//! resend exactly the missing fragments as acknowledged messages until none are missing.
//!
//! Receive side ([`FragmentReceiver`]): one slot per fragment index, answers checkups with a
//! count and completeness requests with the full missing list.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compressor::Payload;
use crate::config::TransferConfig;
use crate::error::{TransferError, TransportError};
use crate::fragment::{fragment_count, fragment_slice, FragmentSlots};
use crate::id::{PeerId, TransferId};
use crate::integrity;
use crate::pacing::{average_ping, CheckupVerdict, Pacer};
use crate::protocol::Message;
use crate::session::cancellable;
use crate::transport::MessageTransport;

/// Callbacks from a running send. Default methods ignore the event.
pub trait SendHooks: Send + Sync {
    /// The first fragment is about to go out.
    fn fragments_started(&self) {}
    fn progress(&self, _bytes: u64, _total: u64) {}
    /// Entering (true) or leaving (false) one round of missing-fragment resends.
    fn recovering(&self, _active: bool) {}
}

pub struct NoHooks;

impl SendHooks for NoHooks {}

/// What one fragmented send took.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentedStats {
    pub fragments: u32,
    pub checkups: u32,
    pub completeness_rounds: u32,
    pub resent: u32,
    pub final_delay: Duration,
}

impl FragmentedStats {
    /// Reliable round trips spent on loss detection.
    pub fn rounds(&self) -> u32 {
        self.checkups + self.completeness_rounds
    }
}

pub struct FragmentedChannel<'a> {
    transport: &'a dyn MessageTransport,
    config: &'a TransferConfig,
}

impl<'a> FragmentedChannel<'a> {
    pub fn new(transport: &'a dyn MessageTransport, config: &'a TransferConfig) -> Self {
        Self { transport, config }
    }

    /// Send `payload` to each peer in turn under a fresh transfer id. One peer's failure does
    /// not stop the others; the result holds one flag per peer, in order.
    pub async fn send_all(
        &self,
        peers: &[PeerId],
        payload: &Payload,
        fragment_size: u32,
        cancel: &CancellationToken,
    ) -> Vec<bool> {
        let mut out = Vec::with_capacity(peers.len());
        for &peer in peers {
            let id = TransferId::generate();
            let result = self
                .send(peer, id, payload, fragment_size, cancel, &NoHooks)
                .await;
            if let Err(e) = &result {
                warn!(peer = %peer, transfer = %id, error = %e, "fragmented send failed");
            }
            out.push(result.is_ok());
        }
        out
    }

    pub async fn send(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        payload: &Payload,
        fragment_size: u32,
        cancel: &CancellationToken,
        hooks: &dyn SendHooks,
    ) -> Result<FragmentedStats, TransferError> {
        let fragment_size = fragment_size.max(1);
        let total = payload.total_length();
        let count = fragment_count(total, fragment_size).ok_or_else(|| {
            TransferError::LocalIo(format!(
                "{} bytes do not fit {}-byte fragments",
                total, fragment_size
            ))
        })?;
        self.ensure_alive(peer)?;

        let start_delay = self.measure_delay(peer, cancel).await?;
        self.announce(peer, transfer_id, payload, fragment_size, count, cancel)
            .await?;
        info!(
            peer = %peer,
            transfer = %transfer_id,
            fragments = count,
            fragment_size,
            delay_ms = start_delay.as_millis() as u64,
            "fragmented transfer announced"
        );

        let mut stats = FragmentedStats {
            fragments: count,
            ..Default::default()
        };
        let mut pacer = Pacer::new(start_delay, self.config);
        let mut checkpoint = 0u32;
        let mut sent_bytes = 0u64;
        hooks.fragments_started();

        for index in 0..count {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            self.ensure_alive(peer)?;
            let bytes = fragment_slice(payload.bytes(), index, fragment_size).to_vec();
            let len = bytes.len() as u64;
            let msg = Message::Fragment {
                transfer_id,
                index,
                bytes,
            };
            match self.transport.send(peer, msg).await {
                Ok(()) | Err(TransportError::Timeout) | Err(TransportError::Io(_)) => {}
                Err(e) => return Err(TransferError::from_transfer(e, "fragment send")),
            }
            sent_bytes += len;
            hooks.progress(sent_bytes, total);

            let next = index + 1;
            if next == count {
                break;
            }
            let since = next - checkpoint;
            if since >= pacer.interval() {
                let missing = self
                    .checkup(peer, transfer_id, checkpoint, next, cancel)
                    .await?;
                stats.checkups += 1;
                match pacer.on_checkup(since, missing) {
                    CheckupVerdict::Abort => {
                        return Err(TransferError::PeerAbort(format!(
                            "receiver returned {} at checkup [{}, {})",
                            missing, checkpoint, next
                        )))
                    }
                    verdict => debug!(
                        transfer = %transfer_id,
                        range_start = checkpoint,
                        range_end = next,
                        missing,
                        ?verdict,
                        delay_ms = pacer.delay().as_millis() as u64,
                        interval = pacer.interval(),
                        "checkup"
                    ),
                }
                checkpoint = next;
            }
            cancellable(cancel, tokio::time::sleep(pacer.delay())).await?;
        }

        loop {
            let missing = self.completeness(peer, transfer_id, cancel).await?;
            stats.completeness_rounds += 1;
            if missing.is_empty() {
                break;
            }
            hooks.recovering(true);
            info!(
                transfer = %transfer_id,
                missing = missing.len(),
                round = stats.completeness_rounds,
                "resending missing fragments"
            );
            for index in missing {
                if index >= count {
                    return Err(TransferError::PeerAbort(format!(
                        "receiver reported fragment {} of {}",
                        index, count
                    )));
                }
                self.ensure_alive(peer)?;
                let bytes = fragment_slice(payload.bytes(), index, fragment_size).to_vec();
                self.resend(peer, transfer_id, index, bytes, cancel).await?;
                stats.resent += 1;
            }
            hooks.recovering(false);
        }

        stats.final_delay = pacer.delay();
        info!(
            transfer = %transfer_id,
            checkups = stats.checkups,
            rounds = stats.completeness_rounds,
            resent = stats.resent,
            "fragmented transfer complete"
        );
        Ok(stats)
    }

    fn ensure_alive(&self, peer: PeerId) -> Result<(), TransferError> {
        if self.transport.is_alive(peer) {
            Ok(())
        } else {
            Err(TransferError::Disconnected)
        }
    }

    /// Starting gap: fixed for loopback, otherwise the average of serial probes.
    async fn measure_delay(
        &self,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<Duration, TransferError> {
        if self.transport.is_loopback(peer) {
            return Ok(self.config.loopback_delay());
        }
        let mut samples = Vec::with_capacity(self.config.ping_probes as usize);
        for probe in 0..self.config.ping_probes {
            if probe > 0 {
                cancellable(cancel, tokio::time::sleep(self.config.probe_spacing())).await?;
            }
            let nonce: u64 = rand::random();
            let started = Instant::now();
            let reply = cancellable(
                cancel,
                self.transport.request(
                    peer,
                    Message::Probe { nonce },
                    self.config.request_timeout(),
                ),
            )
            .await?;
            match reply {
                Ok(Message::ProbeReply { nonce: n }) if n == nonce => {
                    samples.push(started.elapsed())
                }
                Ok(other) => warn!(peer = %peer, reply = other.name(), "unexpected probe reply"),
                Err(TransportError::Disconnected) => return Err(TransferError::Disconnected),
                Err(e) => debug!(peer = %peer, error = %e, "probe lost"),
            }
        }
        average_ping(&samples)
            .map(|avg| avg.max(self.config.min_delay()))
            .ok_or(TransferError::PeerTimeout("ping probe"))
    }

    async fn announce(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        payload: &Payload,
        fragment_size: u32,
        fragment_count: u32,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let msg = Message::Announce {
            transfer_id,
            logical_name: payload.logical_name().to_string(),
            total_length: payload.total_length(),
            compressed: payload.is_compressed(),
            fragment_size,
            fragment_count,
            digest: *payload.digest(),
        };
        let reply = cancellable(
            cancel,
            self.transport
                .request(peer, msg, self.config.request_timeout()),
        )
        .await?
        .map_err(TransferError::from_handshake)?;
        match reply {
            Message::Ack { .. } => Ok(()),
            Message::Reject { reason, .. } => Err(TransferError::NegotiationFailure(reason)),
            other => Err(TransferError::NegotiationFailure(format!(
                "unexpected {} in reply to announce",
                other.name()
            ))),
        }
    }

    /// Request with one retry on timeout; a second timeout is a peer timeout for `stage`.
    async fn request_twice(
        &self,
        peer: PeerId,
        msg: Message,
        timeout: Duration,
        stage: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Message, TransferError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                cancellable(cancel, self.transport.request(peer, msg.clone(), timeout)).await?;
            match result {
                Ok(reply) => return Ok(reply),
                Err(TransportError::Timeout) if attempt < 2 => {
                    warn!(peer = %peer, stage, "no reply, retrying once");
                }
                Err(e) => return Err(TransferError::from_transfer(e, stage)),
            }
        }
    }

    async fn checkup(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        range_start: u32,
        range_end: u32,
        cancel: &CancellationToken,
    ) -> Result<i64, TransferError> {
        let msg = Message::Checkup {
            transfer_id,
            range_start,
            range_end,
        };
        let reply = self
            .request_twice(peer, msg, self.config.checkup_timeout(), "checkup", cancel)
            .await?;
        match reply {
            Message::CheckupReply { missing, .. } => Ok(missing),
            Message::Reject { reason, .. } => Err(TransferError::PeerAbort(reason)),
            other => Err(unexpected("checkup", &other)),
        }
    }

    async fn completeness(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        cancel: &CancellationToken,
    ) -> Result<Vec<u32>, TransferError> {
        let msg = Message::CompletenessRequest { transfer_id };
        let reply = self
            .request_twice(
                peer,
                msg,
                self.config.checkup_timeout(),
                "completeness report",
                cancel,
            )
            .await?;
        match reply {
            Message::CompletenessReply { missing, .. } => Ok(missing),
            Message::Reject { reason, .. } => Err(TransferError::PeerAbort(reason)),
            other => Err(unexpected("completeness report", &other)),
        }
    }

    async fn resend(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        index: u32,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let msg = Message::Fragment {
            transfer_id,
            index,
            bytes,
        };
        let reply = self
            .request_twice(
                peer,
                msg,
                self.config.request_timeout(),
                "fragment resend",
                cancel,
            )
            .await?;
        match reply {
            Message::Ack { .. } => Ok(()),
            Message::Reject { reason, .. } => Err(TransferError::PeerAbort(reason)),
            other => Err(unexpected("fragment resend", &other)),
        }
    }
}

fn unexpected(stage: &str, reply: &Message) -> TransferError {
    TransferError::PeerAbort(format!("unexpected {} in reply to {}", reply.name(), stage))
}

/// Receive-side state of one fragmented transfer.
#[derive(Debug)]
pub struct FragmentReceiver {
    transfer_id: TransferId,
    slots: FragmentSlots,
    digest: [u8; 32],
}

impl FragmentReceiver {
    /// Allocate slots for an announce. The announced count must match the layout and stay
    /// within `max_fragments`; nothing is allocated otherwise.
    pub fn new(
        transfer_id: TransferId,
        total_length: u64,
        fragment_size: u32,
        announced_count: u32,
        max_fragments: u32,
        digest: [u8; 32],
    ) -> Result<Self, TransferError> {
        if fragment_size == 0 {
            return Err(TransferError::InvalidFragment("zero fragment size".into()));
        }
        let expected = fragment_count(total_length, fragment_size).ok_or_else(|| {
            TransferError::InvalidFragment(format!(
                "{} bytes in {}-byte fragments overflows the fragment index",
                total_length, fragment_size
            ))
        })?;
        if expected != announced_count {
            return Err(TransferError::InvalidFragment(format!(
                "announced {} fragments, layout gives {}",
                announced_count, expected
            )));
        }
        if expected > max_fragments {
            return Err(TransferError::InvalidFragment(format!(
                "{} fragments exceeds the limit of {}",
                expected, max_fragments
            )));
        }
        let slots = FragmentSlots::new(total_length, fragment_size)
            .map_err(|e| TransferError::InvalidFragment(e.to_string()))?;
        Ok(Self {
            transfer_id,
            slots,
            digest,
        })
    }

    /// Fill a slot. Returns true once every slot is filled.
    pub fn on_fragment(&mut self, index: u32, bytes: Vec<u8>) -> Result<bool, TransferError> {
        self.slots
            .fill(index, bytes)
            .map_err(|e| TransferError::InvalidFragment(e.to_string()))
    }

    pub fn checkup_reply(&self, range_start: u32, range_end: u32) -> Message {
        Message::CheckupReply {
            transfer_id: self.transfer_id,
            missing: self.slots.missing_in_range(range_start, range_end) as i64,
        }
    }

    pub fn completeness_reply(&self) -> Message {
        Message::CompletenessReply {
            transfer_id: self.transfer_id,
            missing: self.slots.missing_indices(),
        }
    }

    pub fn received_bytes(&self) -> u64 {
        self.slots.received_bytes()
    }

    pub fn total_length(&self) -> u64 {
        self.slots.total_length()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.is_complete()
    }

    /// Concatenate in index order and check the announced digest.
    pub fn finish(self) -> Result<Vec<u8>, TransferError> {
        let bytes = self
            .slots
            .reassemble()
            .map_err(|e| TransferError::InvalidFragment(e.to_string()))?;
        if !integrity::verify(&bytes, &self.digest) {
            return Err(TransferError::IntegrityMismatch);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pair, LinkOptions};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn payload(len: usize) -> Payload {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        Payload::new("world", bytes, false)
    }

    fn test_config() -> TransferConfig {
        TransferConfig {
            delay_floor_ms: 0,
            probe_spacing_ms: 1,
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn receiver_reports_missing_and_finishes() {
        let p = payload(100);
        let id = TransferId::generate();
        let mut rx = FragmentReceiver::new(id, 100, 30, 4, 1024, *p.digest()).unwrap();
        for index in [0u32, 2] {
            rx.on_fragment(index, fragment_slice(p.bytes(), index, 30).to_vec())
                .unwrap();
        }
        assert_eq!(
            rx.checkup_reply(0, 4),
            Message::CheckupReply {
                transfer_id: id,
                missing: 2
            }
        );
        assert_eq!(
            rx.completeness_reply(),
            Message::CompletenessReply {
                transfer_id: id,
                missing: vec![1, 3]
            }
        );
        for index in [3u32, 1] {
            rx.on_fragment(index, fragment_slice(p.bytes(), index, 30).to_vec())
                .unwrap();
        }
        assert!(rx.is_complete());
        assert_eq!(rx.finish().unwrap(), p.bytes());
    }

    #[tokio::test]
    async fn receiver_rejects_wrong_count_and_bad_digest() {
        let id = TransferId::generate();
        assert!(FragmentReceiver::new(id, 100, 30, 5, 1024, [0; 32]).is_err());
        let mut rx = FragmentReceiver::new(id, 10, 30, 1, 1024, [0; 32]).unwrap();
        rx.on_fragment(0, vec![1u8; 10]).unwrap();
        assert_eq!(rx.finish().unwrap_err(), TransferError::IntegrityMismatch);
    }

    #[test]
    fn receiver_refuses_unbounded_layouts() {
        let id = TransferId::generate();
        for (total, size, count) in [
            (1u64 << 40, 256u32, 0u32),
            (u64::MAX, 1, u32::MAX),
            (1 << 20, 1, 1 << 20),
        ] {
            let err = FragmentReceiver::new(id, total, size, count, 1 << 16, [0; 32]).unwrap_err();
            assert!(matches!(err, TransferError::InvalidFragment(_)), "{:?}", err);
        }
        assert!(FragmentReceiver::new(id, 1 << 16, 1, 1 << 16, 1 << 16, [0; 32]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn lossless_send_reconstructs_exactly() {
        let config = test_config();
        for (len, size) in [(0usize, 30u32), (1, 30), (100, 30), (90, 30), (10_000, 97)] {
            let link = pair(LinkOptions::default());
            let p = payload(len);
            let id = TransferId::generate();
            let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
            let stats = channel
                .send(link.receiver_id, id, &p, size, &CancellationToken::new(), &NoHooks)
                .await
                .unwrap();
            assert_eq!(stats.resent, 0);
            let installed = link.wait_installs(1).await;
            assert_eq!(installed, vec![("world".to_string(), p.bytes().to_vec())]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lossy_send_recovers_every_fragment() {
        let config = test_config();
        let link = pair(LinkOptions {
            fragment_loss: 0.3,
            seed: 11,
            ..Default::default()
        });
        let p = payload(64 * 1024);
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        let stats = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &p,
                512,
                &CancellationToken::new(),
                &NoHooks,
            )
            .await
            .unwrap();
        assert!(stats.resent > 0);
        assert!(stats.completeness_rounds >= 2);
        assert_eq!(link.wait_installs(1).await[0].1, p.bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn higher_loss_never_needs_fewer_rounds() {
        let config = test_config();
        let p = payload(40 * 1024);
        let mut previous = 0;
        for loss in [0.0, 0.1, 0.3, 0.6] {
            let link = pair(LinkOptions {
                fragment_loss: loss,
                seed: 5,
                latency: Duration::from_millis(80),
                ..Default::default()
            });
            let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
            let stats = channel
                .send(
                    link.receiver_id,
                    TransferId::generate(),
                    &p,
                    256,
                    &CancellationToken::new(),
                    &NoHooks,
                )
                .await
                .unwrap();
            assert!(
                stats.rounds() >= previous,
                "loss {} took {} rounds, less than {}",
                loss,
                stats.rounds(),
                previous
            );
            previous = stats.rounds();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_checkup_covers_first_interval() {
        let config = test_config();
        let link = pair(LinkOptions::default());
        let p = payload(30 * 100);
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &p,
                100,
                &CancellationToken::new(),
                &NoHooks,
            )
            .await
            .unwrap();
        let checkups = link.checkup_ranges();
        assert_eq!(checkups.first(), Some(&(0, 25)));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_checkup_aborts() {
        let config = test_config();
        let link = pair(LinkOptions {
            checkup_override: Some(-1),
            ..Default::default()
        });
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(10_000),
                100,
                &CancellationToken::new(),
                &NoHooks,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::PeerAbort(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_checkup_retried_once_then_times_out() {
        let config = test_config();
        let link = pair(LinkOptions {
            drop_checkups: true,
            ..Default::default()
        });
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(10_000),
                100,
                &CancellationToken::new(),
                &NoHooks,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::PeerTimeout("checkup"));
        assert_eq!(link.checkup_ranges().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_loss_aborts_without_recovery() {
        let config = test_config();
        let link = pair(LinkOptions {
            disconnect_after_fragments: Some(10),
            ..Default::default()
        });
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        let err = channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(10_000),
                100,
                &CancellationToken::new(),
                &NoHooks,
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Disconnected);
        assert!(link.installed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_see_progress_and_recovery() {
        struct Counting {
            bytes: AtomicU64,
            recovering: AtomicU64,
        }
        impl SendHooks for Counting {
            fn progress(&self, bytes: u64, _total: u64) {
                self.bytes.store(bytes, Ordering::SeqCst);
            }
            fn recovering(&self, active: bool) {
                if active {
                    self.recovering.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let config = test_config();
        let link = pair(LinkOptions {
            fragment_loss: 0.5,
            seed: 3,
            ..Default::default()
        });
        let hooks = Arc::new(Counting {
            bytes: AtomicU64::new(0),
            recovering: AtomicU64::new(0),
        });
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        channel
            .send(
                link.receiver_id,
                TransferId::generate(),
                &payload(1_000),
                100,
                &CancellationToken::new(),
                hooks.as_ref(),
            )
            .await
            .unwrap();
        assert_eq!(hooks.bytes.load(Ordering::SeqCst), 1_000);
        assert!(hooks.recovering.load(Ordering::SeqCst) >= 1);
        assert_eq!(link.wait_installs(1).await[0].1, payload(1_000).bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn send_all_reports_per_peer() {
        let config = test_config();
        let link = pair(LinkOptions::default());
        let unknown = PeerId::generate();
        let channel = FragmentedChannel::new(link.sender.as_ref(), &config);
        let flags = channel
            .send_all(
                &[unknown, link.receiver_id],
                &payload(500),
                100,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(flags, vec![false, true]);
    }
}
