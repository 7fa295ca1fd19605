//! Throttling for progress writes.

use std::time::Duration;
use tokio::time::Instant;

/// Default minimum time between two progress writes.
pub const DEFAULT_TICKER_DELAY: Duration = Duration::from_secs(1);

/// Decides when the current tick count is worth persisting.
///
/// Fast tasks would otherwise write their progress once per item. The ticker
/// lets at most one unforced write through per `minimum_interval`; forced
/// writes (suspension, completion, errors) always go through.
#[derive(Debug, Clone)]
pub struct Ticker {
    minimum_interval: Duration,
    last_persisted_at: Instant,
}

impl Ticker {
    /// Create a ticker whose window starts at `started_at`.
    pub fn new(minimum_interval: Duration, started_at: Instant) -> Self {
        Self {
            minimum_interval,
            last_persisted_at: started_at,
        }
    }

    /// Returns true if progress should be written now, and if so restarts
    /// the window at `now`.
    pub fn should_persist(&mut self, now: Instant, force: bool) -> bool {
        let due = force || now.saturating_duration_since(self.last_persisted_at) >= self.minimum_interval;
        if due {
            self.last_persisted_at = now;
        }
        due
    }

    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }
}
