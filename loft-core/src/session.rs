//! Per-transfer state and its lifecycle rules.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::coordinator::TransferOutcome;
use crate::error::TransferError;
use crate::fragmented::FragmentReceiver;
use crate::id::{PeerId, TransferId};
use crate::progress::ProgressThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Stream,
    Fragmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pending,
    InProgress,
    RecoveringMissing,
    Completed,
    Cancelled,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Failed)
    }
}

/// Run `fut` unless `cancel` fires first. Used at every cooperative suspension point.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Receive-side metadata from an announce or stream offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub logical_name: String,
    pub total_length: u64,
    pub compressed: bool,
    pub digest: [u8; 32],
}

/// Mutable state of one in-flight transfer. Lives in the registry; only the coordinator
/// mutates it.
#[derive(Debug)]
pub struct TransferSession {
    id: TransferId,
    peer: PeerId,
    direction: Direction,
    logical_name: String,
    strategy: Strategy,
    downgraded: bool,
    fragments_started: bool,
    status: Status,
    total_bytes: u64,
    bytes_transferred: u64,
    pub(crate) incoming: Option<Incoming>,
    pub(crate) fragments: Option<FragmentReceiver>,
    pub(crate) stream_buf: Option<Vec<u8>>,
    pub(crate) keepalive_token: Option<u64>,
    pub(crate) finalizing: bool,
    pub(crate) completion: Option<oneshot::Sender<TransferOutcome>>,
    aborted: Option<TransferError>,
    pub(crate) throttle: ProgressThrottle,
    started: Instant,
    last_activity: Instant,
    cancel: CancellationToken,
    unwound: watch::Sender<bool>,
}

impl TransferSession {
    pub fn new(
        id: TransferId,
        peer: PeerId,
        direction: Direction,
        strategy: Strategy,
        logical_name: impl Into<String>,
        progress_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        let (unwound, _) = watch::channel(false);
        Self {
            id,
            peer,
            direction,
            logical_name: logical_name.into(),
            strategy,
            downgraded: false,
            fragments_started: false,
            status: Status::Pending,
            total_bytes: 0,
            bytes_transferred: 0,
            incoming: None,
            fragments: None,
            stream_buf: None,
            keepalive_token: None,
            finalizing: false,
            completion: None,
            aborted: None,
            throttle: ProgressThrottle::new(progress_interval, now),
            started: now,
            last_activity: now,
            cancel: CancellationToken::new(),
            unwound,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn downgraded(&self) -> bool {
        self.downgraded
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves to true once the driving task has let go of the session.
    pub fn unwound(&self) -> watch::Receiver<bool> {
        self.unwound.subscribe()
    }

    pub(crate) fn mark_unwound(&self) {
        self.unwound.send_replace(true);
    }

    /// Stop the driving task with `reason` instead of a plain cancellation.
    pub(crate) fn abort_with(&mut self, reason: TransferError) {
        if self.aborted.is_none() {
            self.aborted = Some(reason);
        }
        self.cancel.cancel();
    }

    pub(crate) fn take_abort_reason(&mut self) -> Option<TransferError> {
        self.aborted.take()
    }

    pub fn set_total(&mut self, total: u64) {
        self.total_bytes = total;
    }

    /// Move to `next`. Terminal states are sticky: returns false and changes nothing once
    /// the session has completed, failed or been cancelled.
    pub fn set_status(&mut self, next: Status) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next == Status::RecoveringMissing && self.strategy != Strategy::Fragmented {
            return false;
        }
        self.status = next;
        true
    }

    /// Record cumulative progress. Stream progress never goes backwards; fragmented progress
    /// is whatever the slot coverage says.
    pub fn record_progress(&mut self, bytes: u64) {
        self.bytes_transferred = match self.strategy {
            Strategy::Stream => self.bytes_transferred.max(bytes),
            Strategy::Fragmented => bytes,
        };
        self.last_activity = Instant::now();
    }

    /// Fix the strategy chosen at negotiation. Only while the session is still pending.
    pub(crate) fn settle_strategy(&mut self, strategy: Strategy) -> bool {
        if self.status != Status::Pending {
            return false;
        }
        self.strategy = strategy;
        true
    }

    /// Note that the first fragment went out. Downgrades are illegal from here on.
    pub fn mark_fragments_started(&mut self) {
        self.fragments_started = true;
    }

    /// One-time Stream → Fragmented switch. Resets byte bookkeeping to zero.
    pub fn downgrade(&mut self) -> bool {
        if self.strategy != Strategy::Stream
            || self.downgraded
            || self.fragments_started
            || self.status.is_terminal()
        {
            return false;
        }
        self.strategy = Strategy::Fragmented;
        self.downgraded = true;
        self.bytes_transferred = 0;
        self.stream_buf = None;
        self.throttle.reset(Instant::now());
        true
    }

    /// Receive side: switch to the strategy the sender chose. The sender owns the downgrade
    /// rule, so this only resets bookkeeping.
    pub(crate) fn accept_strategy(&mut self, strategy: Strategy) {
        if self.strategy == Strategy::Stream && strategy == Strategy::Fragmented {
            self.downgraded = true;
        }
        self.strategy = strategy;
        self.bytes_transferred = 0;
        self.fragments = None;
        self.stream_buf = None;
        self.throttle.reset(Instant::now());
    }
}
