//! Per-connection liveness supervision.
//!
//! The supervisor does not pair pings with acknowledgements. Any
//! acknowledgement that arrives between two ticks counts as proof of life,
//! so a dead peer is detected after at most `interval * (max_attempts + 1)`.

use mesa_core::{Envelope, op};
use serde_json::json;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// What the connection should do after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatAction {
    Ping(Envelope),
    Disconnect { attempts: u32 },
}

/// Counters for one connection's heartbeat. Owned by that connection's task.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    tick_count: u64,
    ack_buffer: Vec<Envelope>,
    attempts: u32,
    max_attempts: u32,
}

impl HeartbeatState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            tick_count: 0,
            ack_buffer: Vec::new(),
            attempts: 0,
            max_attempts,
        }
    }

    pub fn record_ack(&mut self, ack: Envelope) {
        self.ack_buffer.push(ack);
    }

    pub fn tick(&mut self) -> HeartbeatAction {
        let alive = !self.ack_buffer.is_empty() || self.tick_count == 0;
        self.ack_buffer.clear();
        self.tick_count += 1;

        if alive {
            self.attempts = 0;
            return HeartbeatAction::Ping(Envelope::empty(op::HEARTBEAT_PING));
        }

        self.attempts += 1;
        if self.attempts > self.max_attempts {
            return HeartbeatAction::Disconnect {
                attempts: self.max_attempts,
            };
        }
        HeartbeatAction::Ping(Envelope::new(
            op::HEARTBEAT_PING,
            json!({ "tries": self.attempts, "max": self.max_attempts }),
        ))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

/// A [`HeartbeatState`] driven by a timer.
pub(crate) struct Supervisor {
    pub(crate) state: HeartbeatState,
    interval: Interval,
}

impl Supervisor {
    /// The first tick fires one full period after creation.
    pub(crate) fn new(period: Duration, max_attempts: u32) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            state: HeartbeatState::new(max_attempts),
            interval,
        }
    }
}

/// Resolve on the next tick, or never when supervision is off.
pub(crate) async fn next_tick(supervisor: Option<&mut Supervisor>) {
    match supervisor {
        Some(supervisor) => {
            supervisor.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
