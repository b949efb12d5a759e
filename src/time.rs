//! Time sources used by time-bounded replay.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A monotonic clock. `now` is the elapsed time since an arbitrary origin.
pub trait TimeSource: Send + Sync + Debug {
    fn now(&self) -> Duration;
}

/// Reads the tokio clock, so paused test time is honoured.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A manually driven clock.
#[derive(Debug, Default)]
pub struct VirtualClock {
    nanos: AtomicU64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(saturating_nanos(by), Ordering::AcqRel);
    }

    /// Moves the clock to `at`. Moving backwards is ignored.
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(saturating_nanos(at), Ordering::AcqRel);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_is_monotonic() {
        let clock = VirtualClock::new();
        clock.advance(Duration::from_millis(150));
        clock.set(Duration::from_millis(100));
        assert_eq!(clock.now(), Duration::from_millis(150));
        clock.set(Duration::from_millis(160));
        assert_eq!(clock.now(), Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::new();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(clock.now() >= Duration::from_millis(250));
    }
}
