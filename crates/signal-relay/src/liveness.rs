//! Heartbeat-based liveness detection (resident relay only)
//!
//! Every sweep probes each connection with a transport ping. A connection that
//! has not answered the previous probe by the next sweep is evicted.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Time between liveness sweeps
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(30_000);

/// Close code sent to evicted connections
pub const LIVENESS_CLOSE_CODE: u16 = 1000;

/// Close reason sent to evicted connections
pub const LIVENESS_CLOSE_REASON: &str = "liveness timeout";

/// What a sweep should do with one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Send a transport ping and wait for the pong
    Ping,
    /// Previous ping went unanswered
    Evict,
}

/// Per-connection heartbeat state
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    awaiting_pong: bool,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one sweep
    pub fn on_tick(&mut self) -> Probe {
        if self.awaiting_pong {
            Probe::Evict
        } else {
            self.awaiting_pong = true;
            Probe::Ping
        }
    }

    /// Transport pong received
    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }
}

/// Sweep timer. The first tick fires one full period after creation.
pub fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
