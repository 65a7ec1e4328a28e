//! Transfer tuning. Every field has a default; hosts embed this as a `[transfer]` table.

use std::time::Duration;

use serde::Deserialize;

/// Default fragment size in bytes (60 KiB, fits one small message with framing to spare).
pub const DEFAULT_FRAGMENT_SIZE: u32 = 61_440;

/// Default number of fragments between two pacing checkups.
pub const DEFAULT_CHECKUP_INTERVAL: u32 = 25;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    pub fragment_size: u32,
    pub checkup_interval: u32,
    /// Serial round-trip probes averaged into the starting delay.
    pub ping_probes: u32,
    pub probe_spacing_ms: u64,
    /// Fixed inter-fragment delay for loopback peers (no probing).
    pub loopback_delay_ms: u64,
    /// Smallest delay a measured ping can start from.
    pub min_delay_ms: u64,
    /// Pacing only speeds up while the delay is above this.
    pub delay_floor_ms: u64,
    pub speedup_factor: f64,
    pub max_delay_ms: u64,
    /// Wait for a reply to announce, offer, fetch and reliable fragment sends.
    pub request_timeout_ms: u64,
    pub checkup_timeout_ms: u64,
    /// Bound on opening and verifying the dedicated stream before falling back.
    pub stream_open_wait_ms: u64,
    /// Stream stall limit; refreshed by every keepalive answer and progress report.
    pub stream_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    /// Minimum wall time between two progress events of one session.
    pub progress_interval_ms: u64,
    /// Receive side gives up after this long without any inbound activity.
    pub receive_idle_timeout_ms: u64,
    pub cancel_ack_timeout_ms: u64,
    /// Largest fragment layout a receiver accepts from an announce.
    pub max_fragments: u32,
    /// Try deflate before sending; raw bytes are kept when it does not shrink the payload.
    pub compress: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            checkup_interval: DEFAULT_CHECKUP_INTERVAL,
            ping_probes: 5,
            probe_spacing_ms: 25,
            loopback_delay_ms: 2,
            min_delay_ms: 1,
            delay_floor_ms: 60,
            speedup_factor: 0.75,
            max_delay_ms: 5_000,
            request_timeout_ms: 5_000,
            checkup_timeout_ms: 5_000,
            stream_open_wait_ms: 3_000,
            stream_timeout_ms: 30_000,
            keepalive_interval_ms: 1_000,
            progress_interval_ms: 250,
            receive_idle_timeout_ms: 60_000,
            cancel_ack_timeout_ms: 2_000,
            max_fragments: 1 << 20,
            compress: true,
        }
    }
}

impl TransferConfig {
    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }

    pub fn loopback_delay(&self) -> Duration {
        Duration::from_millis(self.loopback_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn delay_floor(&self) -> Duration {
        Duration::from_millis(self.delay_floor_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn checkup_timeout(&self) -> Duration {
        Duration::from_millis(self.checkup_timeout_ms)
    }

    pub fn stream_open_wait(&self) -> Duration {
        Duration::from_millis(self.stream_open_wait_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn receive_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_idle_timeout_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }

    /// Fragment size that fits one message of at most `max_message` bytes.
    pub fn effective_fragment_size(&self, max_message: usize) -> u32 {
        let room = max_message.saturating_sub(crate::protocol::FRAGMENT_OVERHEAD);
        let room = u32::try_from(room).unwrap_or(u32::MAX);
        self.fragment_size.min(room).max(1)
    }
}
