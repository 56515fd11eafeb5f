//! Leading/trailing throttle for per-table sync notifications.

use std::time::Duration;
use tokio::time::Instant;

/// Lets at most one call through per window.
///
/// The first call of a quiet period fires immediately. Calls landing inside
/// the window collapse into a single trailing call at the end of it.
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    last: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            pending: false,
        }
    }

    /// Register a call at `now`. Returns true if it should fire right away.
    pub fn hit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now < last + self.window => {
                self.pending = true;
                false
            }
            _ => {
                self.last = Some(now);
                self.pending = false;
                true
            }
        }
    }

    /// When the deferred trailing call is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending {
            self.last.map(|last| last + self.window)
        } else {
            None
        }
    }

    /// Take the trailing call. Returns true if one was pending.
    pub fn flush(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        self.pending = false;
        self.last = Some(now);
        true
    }
}
