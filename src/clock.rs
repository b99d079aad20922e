//! Wall-clock sources for expiry checks.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of the current UTC time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from the tokio monotonic clock, anchored at a fixed
/// UTC instant. Follows `tokio::time::pause`/`advance`, so timer-driven
/// code can be exercised without waiting.
#[derive(Debug, Clone, Copy)]
pub struct AnchoredClock {
    origin: DateTime<Utc>,
    anchor: Instant,
}

impl AnchoredClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            anchor: Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        self.origin + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
