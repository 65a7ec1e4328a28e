//! Progress events pushed to a UI-like collaborator, rate limited per session.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::TransferError;
use crate::id::{PeerId, TransferId};
use crate::session::{Direction, Status, Strategy};

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Cumulative bytes of the current strategy.
    Progress {
        transfer_id: TransferId,
        peer: PeerId,
        direction: Direction,
        bytes: u64,
        total: u64,
        eta_secs: Option<f64>,
    },
    /// Strategy picked or downgraded. Byte counts restart from zero after a downgrade.
    StrategyChanged {
        transfer_id: TransferId,
        peer: PeerId,
        strategy: Strategy,
    },
    /// Terminal event, exactly one per session.
    Finished {
        transfer_id: TransferId,
        peer: PeerId,
        direction: Direction,
        status: Status,
        error: Option<TransferError>,
    },
}

/// Must not block: implementations queue or drop.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

/// Queues events on an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn on_event(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// At most one event per `interval`, except the one that reaches the total.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            started: now,
            last_emit: None,
        }
    }

    /// Restart timing, e.g. after a strategy downgrade.
    pub fn reset(&mut self, now: Instant) {
        self.started = now;
        self.last_emit = None;
    }

    pub fn should_emit(&mut self, now: Instant, bytes: u64, total: u64) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || bytes >= total {
            self.last_emit = Some(now);
            return true;
        }
        false
    }

    pub fn eta_secs(&self, now: Instant, bytes: u64, total: u64) -> Option<f64> {
        eta_secs(now.duration_since(self.started), bytes, total)
    }
}

/// Seconds left at the average rate so far. `None` until some bytes have moved.
pub fn eta_secs(elapsed: Duration, bytes: u64, total: u64) -> Option<f64> {
    if bytes == 0 || elapsed.is_zero() {
        return None;
    }
    let rate = bytes as f64 / elapsed.as_secs_f64();
    Some(total.saturating_sub(bytes) as f64 / rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttle_limits_rate_but_passes_completion() {
        let start = Instant::now();
        let mut t = ProgressThrottle::new(Duration::from_millis(250), start);
        assert!(t.should_emit(start, 1, 100));
        assert!(!t.should_emit(start + Duration::from_millis(100), 2, 100));
        assert!(t.should_emit(start + Duration::from_millis(260), 3, 100));
        assert!(!t.should_emit(start + Duration::from_millis(300), 4, 100));
        assert!(t.should_emit(start + Duration::from_millis(301), 100, 100));
    }

    #[test]
    fn eta_from_average_rate() {
        assert_eq!(eta_secs(Duration::from_secs(2), 0, 100), None);
        let eta = eta_secs(Duration::from_secs(2), 50, 150).unwrap();
        assert!((eta - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn channel_sink_queues() {
        let (sink, mut rx) = ChannelSink::new();
        let event = ProgressEvent::StrategyChanged {
            transfer_id: TransferId::generate(),
            peer: PeerId::generate(),
            strategy: Strategy::Fragmented,
        };
        sink.on_event(event.clone());
        assert_eq!(rx.recv().await, Some(event));
    }
}
