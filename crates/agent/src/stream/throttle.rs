//! Leading/trailing-edge throttle.
//!
//! The first event in a quiet period fires at once. Events arriving inside
//! the interval collapse into a single trailing fire at the end of it, so
//! the last state is always delivered.

use std::time::Duration;
use tokio::time::Instant;

/// What the caller should do with an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Deliver now
    FireNow,
    /// Arm a timer; deliver when it expires
    ScheduleTrailing(Duration),
    /// A trailing fire is already armed and will carry this event
    Coalesce,
}

#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fire: Option<Instant>,
    trailing_pending: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fire: None,
            trailing_pending: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn on_event(&mut self, now: Instant) -> ThrottleDecision {
        if self.trailing_pending {
            return ThrottleDecision::Coalesce;
        }

        match self.last_fire {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                self.trailing_pending = true;
                ThrottleDecision::ScheduleTrailing(self.interval - now.saturating_duration_since(last))
            }
            _ => {
                self.last_fire = Some(now);
                ThrottleDecision::FireNow
            }
        }
    }

    /// The armed timer expired. Returns false if there was nothing to fire.
    pub fn on_trailing_fire(&mut self, now: Instant) -> bool {
        if !self.trailing_pending {
            return false;
        }
        self.trailing_pending = false;
        self.last_fire = Some(now);
        true
    }

    /// Disarm a pending trailing fire so the caller can deliver synchronously.
    /// Returns whether one was pending.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.trailing_pending)
    }

    pub fn is_pending(&self) -> bool {
        self.trailing_pending
    }
}
