//! The single re-armable consensus timer.
//!
//! A node has at most one pending deadline. Arming always replaces the
//! previous deadline. The deadline is a plain value tagged with the
//! (height, view) it was armed for, so a timer that fires after the round
//! moved on is recognised as stale by comparing tags.

use std::time::{Duration, Instant};

/// The event delivered when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub height: u32,
    pub view: u8,
}

/// A pending deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimeout {
    pub deadline: Instant,
    pub height: u32,
    pub view: u8,
}

impl ScheduledTimeout {
    pub fn timeout(&self) -> Timeout {
        Timeout {
            height: self.height,
            view: self.view,
        }
    }
}

/// Delay before a primary proposes: whatever is left of the block interval
/// since the previous block was persisted.
pub fn leader_delay(block_interval: Duration, elapsed_since_block: Duration) -> Duration {
    block_interval.saturating_sub(elapsed_since_block)
}

/// Per-view exponential backoff: `block_interval << min(view + 1, cap)`.
pub fn backoff_delay(block_interval: Duration, view: u8, max_exponent: u32) -> Duration {
    let exponent = (u32::from(view).saturating_add(1)).min(max_exponent).min(31);
    block_interval.saturating_mul(1u32 << exponent)
}

/// Owns the node's single pending deadline.
#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    pending: Option<ScheduledTimeout>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline `delay` after `now` for the given round, replacing any
    /// pending one.
    pub fn arm(&mut self, height: u32, view: u8, delay: Duration, now: Instant) -> ScheduledTimeout {
        let scheduled = ScheduledTimeout {
            deadline: now.checked_add(delay).unwrap_or(now),
            height,
            view,
        };
        self.pending = Some(scheduled);
        scheduled
    }

    /// Cancel the pending deadline.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// The pending deadline, if any.
    pub fn pending(&self) -> Option<&ScheduledTimeout> {
        self.pending.as_ref()
    }

    /// Time left before the pending deadline, zero if it already passed.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.pending
            .map(|scheduled| scheduled.deadline.saturating_duration_since(now))
    }

    /// Push the pending deadline back by `extra`.
    pub fn extend(&mut self, extra: Duration) {
        if let Some(scheduled) = self.pending.as_mut() {
            if let Some(deadline) = scheduled.deadline.checked_add(extra) {
                scheduled.deadline = deadline;
            }
        }
    }

    /// Take the pending deadline if it has passed. Each deadline fires once.
    pub fn take_expired(&mut self, now: Instant) -> Option<Timeout> {
        match self.pending {
            Some(scheduled) if scheduled.deadline <= now => {
                self.pending = None;
                Some(scheduled.timeout())
            }
            _ => None,
        }
    }
}
