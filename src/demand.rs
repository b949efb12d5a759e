//! Per-subscriber outstanding demand.
//!
//! Demand is the number of values a subscriber is still willing to accept.
//! Requests accumulate with saturating addition; once the counter reaches
//! [`UNBOUNDED`] it stays there and deliveries no longer decrement it.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Demand value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

#[derive(Debug, Default)]
pub(crate) struct Demand {
    requested: CachePadded<AtomicU64>,
}

impl Demand {
    /// Adds `n` to the outstanding demand and returns the previous value.
    #[inline]
    pub(crate) fn add(&self, n: u64) -> u64 {
        // The closure always returns `Some`, so both arms carry the previous value.
        match self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Records `n` delivered values.
    #[inline]
    pub(crate) fn produced(&self, n: u64) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == UNBOUNDED {
                    None
                } else {
                    Some(current.saturating_sub(n))
                }
            });
    }

    /// Consumes one unit of demand, returning `false` when none is left.
    #[inline]
    pub(crate) fn try_take(&self) -> bool {
        self.requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match current {
                    0 => None,
                    UNBOUNDED => Some(UNBOUNDED),
                    n => Some(n - 1),
                }
            })
            .is_ok()
    }
}

/// Converts a demand counter into the signed capacity reported by
/// [`Lifecycle::available_capacity`](crate::Lifecycle::available_capacity).
#[inline]
pub(crate) fn as_capacity(demand: u64) -> i64 {
    if demand == UNBOUNDED {
        -1
    } else {
        i64::try_from(demand).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_saturates_at_unbounded() {
        let demand = Demand::default();
        assert_eq!(demand.add(5), 0);
        assert_eq!(demand.add(u64::MAX - 2), 5);
        assert_eq!(demand.get(), UNBOUNDED);
    }

    #[test]
    fn test_produced_leaves_unbounded_alone() {
        let demand = Demand::default();
        demand.add(UNBOUNDED);
        demand.produced(1_000);
        assert_eq!(demand.get(), UNBOUNDED);
    }

    #[test]
    fn test_try_take_stops_at_zero() {
        let demand = Demand::default();
        demand.add(2);
        assert!(demand.try_take());
        assert!(demand.try_take());
        assert!(!demand.try_take());
        assert_eq!(demand.get(), 0);
    }

    #[test]
    fn test_produced_never_underflows() {
        let demand = Demand::default();
        demand.add(1);
        demand.produced(3);
        assert_eq!(demand.get(), 0);
    }

    #[test]
    fn test_as_capacity() {
        assert_eq!(as_capacity(UNBOUNDED), -1);
        assert_eq!(as_capacity(7), 7);
    }
}
