//! Adaptive send pacing: the inter-fragment delay and the checkup interval, adjusted after
//! every checkup from the receiver's missing count.

use std::time::Duration;

use crate::config::TransferConfig;

/// What a checkup reply did to the pacing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckupVerdict {
    /// Negative count: the receiver aborted the whole transfer.
    Abort,
    /// Nothing lost and the delay was above the floor: delay shrunk, interval stretched.
    SpeedUp,
    /// `missing` of the last `sent` fragments lost: delay grown by `sent / missing`.
    SlowDown,
    /// Nothing lost but already at or below the floor.
    Hold,
}

#[derive(Debug, Clone)]
pub struct Pacer {
    delay: Duration,
    interval: u32,
    floor: Duration,
    max_delay: Duration,
    speedup: f64,
}

impl Pacer {
    pub fn new(start_delay: Duration, config: &TransferConfig) -> Self {
        Self {
            delay: start_delay.min(config.max_delay()),
            interval: config.checkup_interval.max(1),
            floor: config.delay_floor(),
            max_delay: config.max_delay(),
            speedup: config.speedup_factor.clamp(0.05, 1.0),
        }
    }

    /// Current gap between two fragment sends.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Fragments to send before the next checkup.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Apply a checkup reply covering the last `sent` fragments.
    pub fn on_checkup(&mut self, sent: u32, missing: i64) -> CheckupVerdict {
        if missing < 0 {
            return CheckupVerdict::Abort;
        }
        if missing == 0 {
            if self.delay <= self.floor {
                return CheckupVerdict::Hold;
            }
            self.delay = scale(self.delay, self.speedup);
            self.interval = ((self.interval as f64) / self.speedup).ceil() as u32;
            return CheckupVerdict::SpeedUp;
        }
        let factor = sent.max(1) as f64 / missing as f64;
        self.delay = scale(self.delay, factor).min(self.max_delay);
        CheckupVerdict::SlowDown
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

/// Average of the successful probe round trips; `None` when every probe failed.
pub fn average_ping(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}
