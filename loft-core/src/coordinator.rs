//! Transfer orchestration. Picks a strategy, downgrades a failed stream once, pushes progress,
//! cancels cooperatively, and dispatches every inbound control message for both directions.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compressor::{Compressor, Deflate, Payload, PayloadCompressor};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::fragmented::{FragmentReceiver, FragmentedChannel, SendHooks};
use crate::id::{PeerId, TransferId};
use crate::integrity;
use crate::progress::{NoopSink, ProgressEvent, ProgressSink};
use crate::protocol::Message;
use crate::registry::{SessionInfo, SessionKey, TransferRegistry};
use crate::session::{cancellable, Direction, Incoming, Status, Strategy, TransferSession};
use crate::stream::StreamChannel;
use crate::transport::{DiscardSink, InstallSink, MessageTransport, StreamTransport};

/// Upper bound on the receive buffer reserved up front for a stream offer.
const STREAM_PREALLOC: u64 = 64 * 1024 * 1024;

/// Terminal result of one session, returned to whoever drove it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub transfer_id: TransferId,
    pub peer: PeerId,
    pub direction: Direction,
    pub logical_name: String,
    pub status: Status,
    pub strategy: Strategy,
    pub downgraded: bool,
    /// Bytes of the final strategy only; a downgrade starts counting again from zero.
    pub bytes: u64,
    pub total: u64,
    pub elapsed: Duration,
    /// `None` exactly when `status` is `Completed`.
    pub error: Option<TransferError>,
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    fn from_session(session: &TransferSession, error: Option<TransferError>) -> Self {
        Self {
            transfer_id: session.id(),
            peer: session.peer(),
            direction: session.direction(),
            logical_name: session.logical_name().to_string(),
            status: session.status(),
            strategy: session.strategy(),
            downgraded: session.downgraded(),
            bytes: session.bytes_transferred(),
            total: session.total_bytes(),
            elapsed: session.elapsed(),
            error,
        }
    }

    /// Outcome for a session that never registered or was already torn down elsewhere.
    fn detached(key: SessionKey, direction: Direction, name: &str, error: TransferError) -> Self {
        let status = if error == TransferError::Cancelled {
            Status::Cancelled
        } else {
            Status::Failed
        };
        Self {
            transfer_id: key.id,
            peer: key.peer,
            direction,
            logical_name: name.to_string(),
            status,
            strategy: Strategy::Fragmented,
            downgraded: false,
            bytes: 0,
            total: 0,
            elapsed: Duration::ZERO,
            error: Some(error),
        }
    }
}

enum Cancelling {
    /// A driving task owns the session; wait for it to let go.
    Unwinding(watch::Receiver<bool>),
    Closed,
}

enum Assembled {
    Fragments(FragmentReceiver),
    Stream(Vec<u8>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn reject(transfer_id: TransferId, reason: impl Into<String>) -> Message {
    Message::Reject {
        transfer_id,
        reason: reason.into(),
    }
}

/// Drives transfers in both directions for one node. Cheap to share behind an `Arc`; the
/// registry lock is never held across an await.
pub struct TransferCoordinator {
    config: TransferConfig,
    messages: Arc<dyn MessageTransport>,
    streams: Option<Arc<dyn StreamTransport>>,
    compressor: Option<Arc<PayloadCompressor>>,
    codec: Arc<dyn Compressor>,
    install: Arc<dyn InstallSink>,
    progress: Arc<dyn ProgressSink>,
    registry: Mutex<TransferRegistry>,
}

impl TransferCoordinator {
    pub fn new(config: TransferConfig, messages: Arc<dyn MessageTransport>) -> Self {
        Self {
            config,
            messages,
            streams: None,
            compressor: None,
            codec: Arc::new(Deflate::default()),
            install: Arc::new(DiscardSink),
            progress: Arc::new(NoopSink),
            registry: Mutex::new(TransferRegistry::new()),
        }
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamTransport>) -> Self {
        self.streams = Some(streams);
        self
    }

    /// Payload source for the send side. Its codec also undoes compression on receive.
    pub fn with_compressor(mut self, compressor: Arc<PayloadCompressor>) -> Self {
        self.codec = compressor.codec().clone();
        self.compressor = Some(compressor);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Compressor>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_install_sink(mut self, install: Arc<dyn InstallSink>) -> Self {
        self.install = install;
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        lock(&self.registry).snapshot()
    }

    pub fn sessions_for(&self, peer: PeerId) -> Vec<SessionKey> {
        lock(&self.registry).sessions_for(peer)
    }

    /// Gather `source_key` and deliver it to `peer`. Stream is tried first when
    /// `prefer_stream` is set and the peer supports it.
    pub async fn begin_send(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        source_key: &str,
        prefer_stream: bool,
    ) -> TransferOutcome {
        let strategy = initial_strategy(prefer_stream);
        match self.register(peer, transfer_id, Direction::Send, source_key, strategy, None) {
            Ok((key, cancel)) => {
                self.run_send(key, cancel, source_key, prefer_stream)
                    .await
            }
            Err(e) => TransferOutcome::detached(
                SessionKey::new(peer, transfer_id),
                Direction::Send,
                source_key,
                e,
            ),
        }
    }

    /// Deliver an already obtained payload.
    pub async fn send_payload(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        payload: Arc<Payload>,
        prefer_stream: bool,
    ) -> TransferOutcome {
        let strategy = initial_strategy(prefer_stream);
        let name = payload.logical_name();
        let (key, cancel) =
            match self.register(peer, transfer_id, Direction::Send, name, strategy, None) {
                Ok(registered) => registered,
                Err(e) => {
                    return TransferOutcome::detached(
                        SessionKey::new(peer, transfer_id),
                        Direction::Send,
                        name,
                        e,
                    )
                }
            };
        let result = self.drive_send(key, &payload, prefer_stream, &cancel).await;
        self.finish_send(key, name, result).await
    }

    /// Deliver one payload to many peers concurrently. Each peer gets its own session and
    /// outcome, in the order given; one peer failing does not affect the rest.
    pub async fn broadcast(
        self: &Arc<Self>,
        peers: &[PeerId],
        payload: Arc<Payload>,
        prefer_stream: bool,
    ) -> Vec<TransferOutcome> {
        let ids: Vec<TransferId> = peers.iter().map(|_| TransferId::generate()).collect();
        let mut tasks = JoinSet::new();
        for (slot, (&peer, &id)) in peers.iter().zip(&ids).enumerate() {
            let this = Arc::clone(self);
            let payload = payload.clone();
            tasks.spawn(async move {
                let outcome = this.send_payload(peer, id, payload, prefer_stream).await;
                (slot, outcome)
            });
        }
        let mut outcomes: Vec<Option<TransferOutcome>> = vec![None; peers.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => outcomes[slot] = Some(outcome),
                Err(e) => warn!(error = %e, "broadcast task failed"),
            }
        }
        outcomes
            .into_iter()
            .enumerate()
            .map(|(slot, outcome)| {
                outcome.unwrap_or_else(|| {
                    TransferOutcome::detached(
                        SessionKey::new(peers[slot], ids[slot]),
                        Direction::Send,
                        payload.logical_name(),
                        TransferError::LocalIo("send task failed".into()),
                    )
                })
            })
            .collect()
    }

    /// Ask `peer` for `logical_name` and wait until it is installed, failed or cancelled.
    /// Gives up when the peer stays silent for the receive idle timeout or drops.
    pub async fn begin_receive(
        &self,
        peer: PeerId,
        logical_name: &str,
        accepts_stream: bool,
    ) -> TransferOutcome {
        let transfer_id = TransferId::generate();
        let accepts_stream = accepts_stream && self.streams.is_some();
        let (tx, rx) = oneshot::channel();
        let (key, cancel) = match self.register(
            peer,
            transfer_id,
            Direction::Receive,
            logical_name,
            initial_strategy(accepts_stream),
            Some(tx),
        ) {
            Ok(registered) => registered,
            Err(e) => {
                return TransferOutcome::detached(
                    SessionKey::new(peer, transfer_id),
                    Direction::Receive,
                    logical_name,
                    e,
                )
            }
        };
        info!(
            peer = %peer,
            transfer = %transfer_id,
            name = logical_name,
            accepts_stream,
            "requesting payload"
        );

        let request = Message::FetchRequest {
            transfer_id,
            logical_name: logical_name.to_string(),
            accepts_stream,
        };
        let asked = cancellable(
            &cancel,
            self.messages
                .request(peer, request, self.config.request_timeout()),
        )
        .await
        .and_then(|reply| reply.map_err(TransferError::from_handshake))
        .and_then(|reply| match reply {
            Message::Ack { .. } => Ok(()),
            Message::Reject { reason, .. } => Err(TransferError::NegotiationFailure(reason)),
            other => Err(TransferError::NegotiationFailure(format!(
                "unexpected {} in reply to fetch request",
                other.name()
            ))),
        });
        match asked {
            Ok(()) => {
                self.update(key, |s| {
                    if s.status() == Status::Pending {
                        s.set_status(Status::InProgress);
                    }
                });
            }
            Err(e) => {
                self.close(key, Err(e));
            }
        }
        self.await_completion(key, logical_name, rx).await
    }

    /// Cancel a session. Returns false when nothing is active under that key, which includes
    /// sessions that already completed. The peer is told best effort; local teardown is
    /// guaranteed once `timeout` passes.
    pub async fn cancel(&self, peer: PeerId, transfer_id: TransferId, timeout: Duration) -> bool {
        let key = SessionKey::new(peer, transfer_id);
        let Some(state) = self.cancel_local(key) else {
            debug!(peer = %peer, transfer = %transfer_id, "cancel for inactive transfer ignored");
            return false;
        };
        info!(peer = %peer, transfer = %transfer_id, "cancelling transfer");
        if let Err(e) = self
            .messages
            .send(peer, Message::Cancel { transfer_id })
            .await
        {
            debug!(peer = %peer, error = %e, "cancel notice not delivered");
        }
        if let Cancelling::Unwinding(mut unwound) = state {
            let acknowledged = tokio::time::timeout(timeout, unwound.wait_for(|done| *done))
                .await
                .is_ok();
            if !acknowledged {
                warn!(transfer = %transfer_id, "transfer did not unwind in time, forcing");
                self.close(key, Err(TransferError::Cancelled));
            }
        }
        true
    }

    /// Inbound dispatch. Returns the reply for request envelopes; replies to oneway
    /// messages are dropped by the transport.
    pub fn handle_message(self: &Arc<Self>, peer: PeerId, message: Message) -> Option<Message> {
        match message {
            Message::Probe { nonce } => Some(Message::ProbeReply { nonce }),
            Message::FetchRequest {
                transfer_id,
                logical_name,
                accepts_stream,
            } => Some(self.on_fetch_request(peer, transfer_id, logical_name, accepts_stream)),
            Message::Announce {
                transfer_id,
                logical_name,
                total_length,
                compressed,
                fragment_size,
                fragment_count,
                digest,
            } => {
                let incoming = Incoming {
                    logical_name,
                    total_length,
                    compressed,
                    digest,
                };
                Some(self.on_announce(peer, transfer_id, incoming, fragment_size, fragment_count))
            }
            Message::Fragment {
                transfer_id,
                index,
                bytes,
            } => Some(self.on_fragment(peer, transfer_id, index, bytes)),
            Message::Checkup {
                transfer_id,
                range_start,
                range_end,
            } => Some(self.on_checkup(peer, transfer_id, range_start, range_end)),
            Message::CompletenessRequest { transfer_id } => {
                Some(self.on_completeness_request(peer, transfer_id))
            }
            Message::StreamOffer {
                transfer_id,
                logical_name,
                total_length,
                compressed,
                digest,
                keepalive_token,
            } => {
                let incoming = Incoming {
                    logical_name,
                    total_length,
                    compressed,
                    digest,
                };
                Some(self.on_stream_offer(peer, transfer_id, incoming, keepalive_token))
            }
            Message::KeepAlive { token } => {
                self.touch_keepalive(peer, token);
                Some(Message::KeepAliveAck { token })
            }
            Message::StreamFinish { transfer_id } => Some(self.on_stream_finish(peer, transfer_id)),
            Message::Cancel { transfer_id } => {
                info!(peer = %peer, transfer = %transfer_id, "peer cancelled transfer");
                self.cancel_local(SessionKey::new(peer, transfer_id));
                Some(Message::Ack { transfer_id })
            }
            Message::Reject {
                transfer_id,
                reason,
            } => {
                self.on_remote_reject(SessionKey::new(peer, transfer_id), reason);
                None
            }
            other => {
                debug!(peer = %peer, message = other.name(), "unsolicited message ignored");
                None
            }
        }
    }

    /// Raw bytes from the dedicated stream for `transfer_id`.
    pub fn on_stream_data(
        self: &Arc<Self>,
        peer: PeerId,
        transfer_id: TransferId,
        bytes: &[u8],
    ) -> Result<(), TransferError> {
        let key = SessionKey::new(peer, transfer_id);
        let accepted = {
            let mut registry = lock(&self.registry);
            let session = registry
                .get_mut(&key)
                .ok_or(TransferError::UnknownTransfer)?;
            let total = session.total_bytes();
            let finalizing = session.finalizing;
            let buf = session
                .stream_buf
                .as_mut()
                .ok_or(TransferError::UnknownTransfer)?;
            if buf.len() as u64 + bytes.len() as u64 > total {
                Err(TransferError::InvalidFragment(
                    "stream ran past the offered length".into(),
                ))
            } else {
                buf.extend_from_slice(bytes);
                let received = buf.len() as u64;
                let complete = received == total && !finalizing;
                if complete {
                    session.finalizing = true;
                }
                Ok((received, complete))
            }
        };
        match accepted {
            Ok((received, complete)) => {
                self.record_progress(key, received);
                if complete {
                    self.spawn_finalize(key);
                }
                Ok(())
            }
            Err(e) => {
                self.close(key, Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Liveness lost. Receive sessions fail at once; send sessions are told to unwind and
    /// report `Disconnected`. Receives already assembling finish their install.
    pub fn on_peer_disconnected(&self, peer: PeerId) {
        let keys = self.sessions_for(peer);
        if !keys.is_empty() {
            warn!(peer = %peer, sessions = keys.len(), "peer disconnected");
        }
        for key in keys {
            let close_now = self
                .update(key, |s| match s.direction() {
                    Direction::Send => {
                        s.abort_with(TransferError::Disconnected);
                        false
                    }
                    Direction::Receive => !s.finalizing,
                })
                .unwrap_or(false);
            if close_now {
                self.close(key, Err(TransferError::Disconnected));
            }
        }
    }

    fn register(
        &self,
        peer: PeerId,
        transfer_id: TransferId,
        direction: Direction,
        logical_name: &str,
        strategy: Strategy,
        completion: Option<oneshot::Sender<TransferOutcome>>,
    ) -> Result<(SessionKey, CancellationToken), TransferError> {
        let mut session = TransferSession::new(
            transfer_id,
            peer,
            direction,
            strategy,
            logical_name,
            self.config.progress_interval(),
        );
        session.completion = completion;
        let cancel = session.cancel_token();
        let key = lock(&self.registry).insert(session)?;
        Ok((key, cancel))
    }

    fn update<T>(&self, key: SessionKey, f: impl FnOnce(&mut TransferSession) -> T) -> Option<T> {
        lock(&self.registry).get_mut(&key).map(f)
    }

    async fn obtain(&self, source_key: &str) -> Result<Arc<Payload>, TransferError> {
        match &self.compressor {
            Some(compressor) => compressor.obtain(source_key).await,
            None => Err(TransferError::LocalIo("no payload source configured".into())),
        }
    }

    async fn run_send(
        &self,
        key: SessionKey,
        cancel: CancellationToken,
        source_key: &str,
        prefer_stream: bool,
    ) -> TransferOutcome {
        let obtained = cancellable(&cancel, self.obtain(source_key))
            .await
            .and_then(|payload| payload);
        let result = match obtained {
            Ok(payload) => self.drive_send(key, &payload, prefer_stream, &cancel).await,
            Err(e) => Err(e),
        };
        self.finish_send(key, source_key, result).await
    }

    async fn drive_send(
        &self,
        key: SessionKey,
        payload: &Payload,
        prefer_stream: bool,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let stream_ready = match (&self.streams, prefer_stream) {
            (Some(streams), true) => {
                let channel =
                    StreamChannel::new(self.messages.as_ref(), streams.as_ref(), &self.config);
                match cancellable(cancel, channel.open(key.peer)).await? {
                    Ok(()) => true,
                    Err(e) => {
                        info!(
                            peer = %key.peer,
                            transfer = %key.id,
                            error = %e,
                            "stream unavailable, sending fragmented"
                        );
                        false
                    }
                }
            }
            _ => false,
        };
        let strategy = if stream_ready {
            Strategy::Stream
        } else {
            Strategy::Fragmented
        };
        let total = payload.total_length();
        self.update(key, |s| {
            s.set_total(total);
            s.settle_strategy(strategy);
            s.set_status(Status::InProgress);
        });
        self.strategy_changed(key, strategy);
        info!(
            peer = %key.peer,
            transfer = %key.id,
            ?strategy,
            bytes = total,
            compressed = payload.is_compressed(),
            "sending payload"
        );

        if strategy == Strategy::Stream {
            match self.send_stream(key, payload, cancel).await {
                Ok(()) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(e) => {
                    if !self.update(key, |s| s.downgrade()).unwrap_or(false) {
                        return Err(e);
                    }
                    warn!(
                        peer = %key.peer,
                        transfer = %key.id,
                        error = %e,
                        "stream failed, downgrading to fragmented"
                    );
                    self.strategy_changed(key, Strategy::Fragmented);
                }
            }
        }
        self.send_fragmented(key, payload, cancel).await
    }

    async fn send_stream(
        &self,
        key: SessionKey,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let Some(streams) = &self.streams else {
            return Err(TransferError::NegotiationFailure(
                "no stream transport".into(),
            ));
        };
        let channel = StreamChannel::new(self.messages.as_ref(), streams.as_ref(), &self.config);
        let on_drain = |bytes: u64, _total: u64| self.record_progress(key, bytes);
        channel
            .send(
                key.peer,
                key.id,
                payload,
                self.config.stream_timeout(),
                cancel,
                &on_drain,
            )
            .await
    }

    async fn send_fragmented(
        &self,
        key: SessionKey,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let fragment_size = self
            .config
            .effective_fragment_size(self.messages.max_message_size());
        let channel = FragmentedChannel::new(self.messages.as_ref(), &self.config);
        let hooks = SessionHooks {
            coordinator: self,
            key,
        };
        let stats = channel
            .send(key.peer, key.id, payload, fragment_size, cancel, &hooks)
            .await?;
        debug!(
            transfer = %key.id,
            fragments = stats.fragments,
            rounds = stats.rounds(),
            resent = stats.resent,
            final_delay_ms = stats.final_delay.as_millis() as u64,
            "fragmented send finished"
        );
        Ok(())
    }

    /// Close a send session and tell the peer why it failed. Cancellation and disconnects
    /// go unannounced.
    async fn finish_send(
        &self,
        key: SessionKey,
        name: &str,
        result: Result<(), TransferError>,
    ) -> TransferOutcome {
        let Some(outcome) = self.close(key, result) else {
            return TransferOutcome::detached(key, Direction::Send, name, TransferError::Cancelled);
        };
        let reason = match &outcome.error {
            Some(TransferError::Disconnected) | None => None,
            Some(e) => e.disconnect_reason(),
        };
        if let Some(reason) = reason {
            if let Err(e) = self.messages.send(key.peer, reject(key.id, reason)).await {
                debug!(peer = %key.peer, error = %e, "failure notice not delivered");
            }
        }
        outcome
    }

    async fn await_completion(
        &self,
        key: SessionKey,
        name: &str,
        mut rx: oneshot::Receiver<TransferOutcome>,
    ) -> TransferOutcome {
        loop {
            tokio::select! {
                outcome = &mut rx => {
                    return outcome.unwrap_or_else(|_| {
                        TransferOutcome::detached(
                            key,
                            Direction::Receive,
                            name,
                            TransferError::Cancelled,
                        )
                    });
                }
                _ = tokio::time::sleep(self.config.keepalive_interval()) => self.check_receive(key),
            }
        }
    }

    fn check_receive(&self, key: SessionKey) {
        let alive = self.messages.is_alive(key.peer);
        let idle_limit = self.config.receive_idle_timeout();
        let verdict = self
            .update(key, |s| {
                if s.finalizing {
                    None
                } else if !alive {
                    Some(TransferError::Disconnected)
                } else if s.idle_for(Instant::now()) > idle_limit {
                    Some(TransferError::PeerTimeout("receive"))
                } else {
                    None
                }
            })
            .flatten();
        if let Some(e) = verdict {
            self.close(key, Err(e));
        }
    }

    fn cancel_local(&self, key: SessionKey) -> Option<Cancelling> {
        {
            let mut registry = lock(&self.registry);
            let session = registry.get_mut(&key)?;
            if session.finalizing {
                return None;
            }
            if session.direction() == Direction::Send {
                session.set_status(Status::Cancelled);
                session.cancel_token().cancel();
                return Some(Cancelling::Unwinding(session.unwound()));
            }
        }
        self.close(key, Err(TransferError::Cancelled))
            .map(|_| Cancelling::Closed)
    }

    fn on_remote_reject(&self, key: SessionKey, reason: String) {
        warn!(peer = %key.peer, transfer = %key.id, reason = %reason, "peer rejected transfer");
        let close_now = self
            .update(key, |s| match s.direction() {
                Direction::Send => {
                    s.abort_with(TransferError::PeerAbort(reason.clone()));
                    false
                }
                Direction::Receive => !s.finalizing,
            })
            .unwrap_or(false);
        if close_now {
            self.close(key, Err(TransferError::PeerAbort(reason)));
        }
    }

    /// Remove the session and publish its terminal state: outcome to the waiter, `Finished`
    /// to the progress sink, unwound signal to a pending cancel. `None` if it was already gone.
    fn close(&self, key: SessionKey, result: Result<(), TransferError>) -> Option<TransferOutcome> {
        let (mut session, result) = {
            let mut registry = lock(&self.registry);
            let mut session = registry.remove(&key)?;
            let result = match (result, session.take_abort_reason()) {
                (Err(TransferError::Cancelled), Some(reason)) => Err(reason),
                (result, _) => result,
            };
            if result.is_ok()
                && session.direction() == Direction::Receive
                && !session.status().is_terminal()
            {
                registry.retire(key, session.total_bytes());
            }
            (session, result)
        };

        let target = match &result {
            Ok(()) => Status::Completed,
            Err(TransferError::Cancelled) => Status::Cancelled,
            Err(_) => Status::Failed,
        };
        session.set_status(target);
        let error = match (session.status(), result) {
            (Status::Completed, _) => None,
            (_, Err(e)) => Some(e),
            (_, Ok(())) => Some(TransferError::Cancelled),
        };
        let outcome = TransferOutcome::from_session(&session, error);
        if let Some(tx) = session.completion.take() {
            let _ = tx.send(outcome.clone());
        }
        session.mark_unwound();

        match &outcome.error {
            None => info!(
                peer = %key.peer,
                transfer = %key.id,
                direction = ?outcome.direction,
                strategy = ?outcome.strategy,
                downgraded = outcome.downgraded,
                bytes = outcome.bytes,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "transfer completed"
            ),
            Some(TransferError::Cancelled) => {
                info!(peer = %key.peer, transfer = %key.id, "transfer cancelled")
            }
            Some(e) => warn!(
                peer = %key.peer,
                transfer = %key.id,
                kind = %e.kind(),
                error = %e,
                "transfer failed"
            ),
        }
        self.progress.on_event(ProgressEvent::Finished {
            transfer_id: key.id,
            peer: key.peer,
            direction: outcome.direction,
            status: outcome.status,
            error: outcome.error.clone(),
        });
        Some(outcome)
    }

    fn strategy_changed(&self, key: SessionKey, strategy: Strategy) {
        self.progress.on_event(ProgressEvent::StrategyChanged {
            transfer_id: key.id,
            peer: key.peer,
            strategy,
        });
    }

    fn record_progress(&self, key: SessionKey, bytes: u64) {
        let event = {
            let mut registry = lock(&self.registry);
            let Some(session) = registry.get_mut(&key) else {
                return;
            };
            session.record_progress(bytes);
            let bytes = session.bytes_transferred();
            let total = session.total_bytes();
            let now = Instant::now();
            if !session.throttle.should_emit(now, bytes, total) {
                return;
            }
            ProgressEvent::Progress {
                transfer_id: key.id,
                peer: key.peer,
                direction: session.direction(),
                bytes,
                total,
                eta_secs: session.throttle.eta_secs(now, bytes, total),
            }
        };
        self.progress.on_event(event);
    }

    fn on_fetch_request(
        self: &Arc<Self>,
        peer: PeerId,
        transfer_id: TransferId,
        logical_name: String,
        accepts_stream: bool,
    ) -> Message {
        if self.compressor.is_none() {
            return reject(transfer_id, "this node serves no payloads");
        }
        let prefer_stream = accepts_stream && self.streams.is_some();
        let (key, cancel) = match self.register(
            peer,
            transfer_id,
            Direction::Send,
            &logical_name,
            initial_strategy(prefer_stream),
            None,
        ) {
            Ok(registered) => registered,
            Err(e) => return reject(transfer_id, e.to_string()),
        };
        info!(peer = %peer, transfer = %transfer_id, name = %logical_name, "serving fetch request");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_send(key, cancel, &logical_name, prefer_stream)
                .await;
        });
        Message::Ack { transfer_id }
    }

    /// Find or create the receive session for an announce or offer and reset it for
    /// `strategy`. Unsolicited offers become receive sessions with no waiter.
    fn prepare_receive<'r>(
        &self,
        registry: &'r mut TransferRegistry,
        key: SessionKey,
        incoming: &Incoming,
        strategy: Strategy,
    ) -> Result<&'r mut TransferSession, String> {
        if !registry.contains(&key) {
            let session = TransferSession::new(
                key.id,
                key.peer,
                Direction::Receive,
                strategy,
                incoming.logical_name.clone(),
                self.config.progress_interval(),
            );
            registry.insert(session).map_err(|e| e.to_string())?;
            info!(
                peer = %key.peer,
                transfer = %key.id,
                name = %incoming.logical_name,
                "receiving unsolicited payload"
            );
        }
        let session = registry
            .get_mut(&key)
            .ok_or_else(|| TransferError::UnknownTransfer.to_string())?;
        if session.direction() != Direction::Receive || session.finalizing {
            return Err("transfer already in progress".into());
        }
        session.accept_strategy(strategy);
        session.incoming = Some(incoming.clone());
        session.set_total(incoming.total_length);
        session.set_status(Status::InProgress);
        session.touch();
        Ok(session)
    }

    fn on_announce(
        self: &Arc<Self>,
        peer: PeerId,
        transfer_id: TransferId,
        incoming: Incoming,
        fragment_size: u32,
        fragment_count: u32,
    ) -> Message {
        let key = SessionKey::new(peer, transfer_id);
        let receiver = match FragmentReceiver::new(
            transfer_id,
            incoming.total_length,
            fragment_size,
            fragment_count,
            self.config.max_fragments,
            incoming.digest,
        ) {
            Ok(receiver) => receiver,
            Err(e) => {
                let reason = e.to_string();
                self.close(key, Err(e));
                return reject(transfer_id, reason);
            }
        };
        let prepared = {
            let mut registry = lock(&self.registry);
            self.prepare_receive(&mut registry, key, &incoming, Strategy::Fragmented)
                .map(|session| {
                    session.fragments = Some(receiver);
                    let complete = fragment_count == 0;
                    session.finalizing = complete;
                    complete
                })
        };
        match prepared {
            Ok(complete) => {
                debug!(
                    peer = %peer,
                    transfer = %transfer_id,
                    fragments = fragment_count,
                    bytes = incoming.total_length,
                    "announce accepted"
                );
                self.strategy_changed(key, Strategy::Fragmented);
                if complete {
                    self.spawn_finalize(key);
                }
                Message::Ack { transfer_id }
            }
            Err(reason) => reject(transfer_id, reason),
        }
    }

    fn on_fragment(
        self: &Arc<Self>,
        peer: PeerId,
        transfer_id: TransferId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Message {
        let key = SessionKey::new(peer, transfer_id);
        let filled = {
            let mut registry = lock(&self.registry);
            if registry.retired(&key).is_some() {
                return Message::Ack { transfer_id };
            }
            let Some(session) = registry.get_mut(&key) else {
                return reject(transfer_id, TransferError::UnknownTransfer.to_string());
            };
            if session.finalizing {
                return Message::Ack { transfer_id };
            }
            let Some(fragments) = session.fragments.as_mut() else {
                return reject(transfer_id, "fragment before announce");
            };
            match fragments.on_fragment(index, bytes) {
                Ok(complete) => {
                    let received = fragments.received_bytes();
                    session.finalizing = complete;
                    Ok((received, complete))
                }
                Err(e) => Err(e),
            }
        };
        match filled {
            Ok((received, complete)) => {
                self.record_progress(key, received);
                if complete {
                    self.spawn_finalize(key);
                }
                Message::Ack { transfer_id }
            }
            Err(e) => {
                debug!(
                    peer = %peer,
                    transfer = %transfer_id,
                    index,
                    error = %e,
                    "fragment refused"
                );
                reject(transfer_id, e.to_string())
            }
        }
    }

    fn on_checkup(&self, peer: PeerId, transfer_id: TransferId, start: u32, end: u32) -> Message {
        let key = SessionKey::new(peer, transfer_id);
        let mut registry = lock(&self.registry);
        let retired = registry.retired(&key).is_some();
        let missing = match registry.get_mut(&key) {
            Some(session) if session.finalizing => 0,
            Some(session) => {
                session.touch();
                match &session.fragments {
                    Some(fragments) => return fragments.checkup_reply(start, end),
                    None => -1,
                }
            }
            None if retired => 0,
            None => -1,
        };
        Message::CheckupReply {
            transfer_id,
            missing,
        }
    }

    fn on_completeness_request(&self, peer: PeerId, transfer_id: TransferId) -> Message {
        let key = SessionKey::new(peer, transfer_id);
        let mut registry = lock(&self.registry);
        let done = Message::CompletenessReply {
            transfer_id,
            missing: Vec::new(),
        };
        let retired = registry.retired(&key).is_some();
        match registry.get_mut(&key) {
            Some(session) if session.finalizing => done,
            Some(session) => {
                session.touch();
                match &session.fragments {
                    Some(fragments) => fragments.completeness_reply(),
                    None => reject(transfer_id, "completeness request before announce"),
                }
            }
            None if retired => done,
            None => reject(transfer_id, TransferError::UnknownTransfer.to_string()),
        }
    }

    fn on_stream_offer(
        self: &Arc<Self>,
        peer: PeerId,
        transfer_id: TransferId,
        incoming: Incoming,
        keepalive_token: u64,
    ) -> Message {
        if self.streams.is_none() {
            return reject(transfer_id, "streams not accepted");
        }
        let key = SessionKey::new(peer, transfer_id);
        let prepared = {
            let mut registry = lock(&self.registry);
            self.prepare_receive(&mut registry, key, &incoming, Strategy::Stream)
                .map(|session| {
                    let reserve = incoming.total_length.min(STREAM_PREALLOC) as usize;
                    session.stream_buf = Some(Vec::with_capacity(reserve));
                    session.keepalive_token = Some(keepalive_token);
                    let complete = incoming.total_length == 0;
                    session.finalizing = complete;
                    complete
                })
        };
        match prepared {
            Ok(complete) => {
                debug!(
                    peer = %peer,
                    transfer = %transfer_id,
                    bytes = incoming.total_length,
                    "stream offer accepted"
                );
                self.strategy_changed(key, Strategy::Stream);
                if complete {
                    self.spawn_finalize(key);
                }
                Message::Ack { transfer_id }
            }
            Err(reason) => reject(transfer_id, reason),
        }
    }

    fn on_stream_finish(&self, peer: PeerId, transfer_id: TransferId) -> Message {
        let key = SessionKey::new(peer, transfer_id);
        let mut registry = lock(&self.registry);
        match registry.get_mut(&key) {
            Some(session) if session.finalizing || session.stream_buf.is_some() => {
                session.touch();
                let received = session
                    .stream_buf
                    .as_ref()
                    .map(|buf| buf.len() as u64)
                    .unwrap_or_else(|| session.total_bytes());
                Message::StreamReport {
                    transfer_id,
                    received,
                    complete: session.finalizing,
                }
            }
            Some(_) => reject(transfer_id, "no stream for transfer"),
            None => match registry.retired(&key) {
                Some(total) => Message::StreamReport {
                    transfer_id,
                    received: total,
                    complete: true,
                },
                None => reject(transfer_id, TransferError::UnknownTransfer.to_string()),
            },
        }
    }

    fn touch_keepalive(&self, peer: PeerId, token: u64) {
        for session in lock(&self.registry).iter_mut() {
            if session.peer() == peer && session.keepalive_token == Some(token) {
                session.touch();
            }
        }
    }

    fn spawn_finalize(self: &Arc<Self>, key: SessionKey) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.finalize(key).await;
            this.close(key, result);
        });
    }

    /// Verify, decompress and install a fully received payload on a blocking worker.
    async fn finalize(&self, key: SessionKey) -> Result<(), TransferError> {
        let (assembled, incoming) = {
            let mut registry = lock(&self.registry);
            let session = registry
                .get_mut(&key)
                .ok_or(TransferError::UnknownTransfer)?;
            let incoming = session
                .incoming
                .clone()
                .ok_or(TransferError::UnknownTransfer)?;
            let assembled = match (session.fragments.take(), session.stream_buf.take()) {
                (Some(fragments), _) => Assembled::Fragments(fragments),
                (None, Some(buf)) => Assembled::Stream(buf),
                (None, None) => return Err(TransferError::UnknownTransfer),
            };
            (assembled, incoming)
        };
        let codec = self.codec.clone();
        let sink = self.install.clone();
        let joined = tokio::task::spawn_blocking(move || -> Result<usize, TransferError> {
            let packed = match assembled {
                Assembled::Fragments(fragments) => fragments.finish()?,
                Assembled::Stream(buf) => {
                    if !integrity::verify(&buf, &incoming.digest) {
                        return Err(TransferError::IntegrityMismatch);
                    }
                    buf
                }
            };
            let bytes = if incoming.compressed {
                codec.decompress(&packed)?
            } else {
                packed
            };
            let len = bytes.len();
            sink.install(&incoming.logical_name, bytes)?;
            Ok(len)
        })
        .await;
        match joined {
            Ok(Ok(len)) => {
                debug!(transfer = %key.id, bytes = len, "payload installed");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(TransferError::LocalIo(format!("install worker failed: {}", e))),
        }
    }
}

fn initial_strategy(prefer_stream: bool) -> Strategy {
    if prefer_stream {
        Strategy::Stream
    } else {
        Strategy::Fragmented
    }
}

struct SessionHooks<'a> {
    coordinator: &'a TransferCoordinator,
    key: SessionKey,
}

impl SendHooks for SessionHooks<'_> {
    fn fragments_started(&self) {
        self.coordinator
            .update(self.key, |s| s.mark_fragments_started());
    }

    fn progress(&self, bytes: u64, _total: u64) {
        self.coordinator.record_progress(self.key, bytes);
    }

    fn recovering(&self, active: bool) {
        let status = if active {
            Status::RecoveringMissing
        } else {
            Status::InProgress
        };
        self.coordinator.update(self.key, |s| s.set_status(status));
    }
}
