//! Idle tracking for the watcher loop.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Derived loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Progress happened within the current idle window.
    Active,
    /// No progress for longer than the idle timeout; the next pass with no
    /// pending files stops the loop.
    Draining,
}

/// The only mutable state carried between passes.
///
/// `idle_timeout` starts at the initial value and drops to the steady value
/// after the first successful transfer. It never goes back up.
#[derive(Debug, Clone)]
pub struct RunState {
    last_progress: Instant,
    idle_timeout: Duration,
    steady_idle_timeout: Duration,
    transfers: u64,
}

impl RunState {
    pub fn new(now: Instant, initial_idle_timeout: Duration, steady_idle_timeout: Duration) -> Self {
        Self {
            last_progress: now,
            idle_timeout: initial_idle_timeout,
            steady_idle_timeout: steady_idle_timeout.min(initial_idle_timeout),
            transfers: 0,
        }
    }

    /// Restart the idle clock without counting a transfer.
    pub fn record_progress(&mut self, now: Instant) {
        if now > self.last_progress {
            self.last_progress = now;
        }
    }

    /// A file reached the archive and its source is gone.
    pub fn record_transfer(&mut self, now: Instant) {
        self.record_progress(now);
        self.transfers += 1;
        self.idle_timeout = self.steady_idle_timeout;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn phase(&self, now: Instant) -> Phase {
        if self.idle_for(now) > self.idle_timeout {
            Phase::Draining
        } else {
            Phase::Active
        }
    }

    /// The loop stops only after a pass that left nothing pending, once the
    /// idle timeout has passed.
    pub fn should_stop(&self, now: Instant, pending: usize) -> bool {
        pending == 0 && self.phase(now) == Phase::Draining
    }
}
