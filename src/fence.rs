//! A try-only lock over a single flag.
//!
//! The fan-out producer path uses a `Fence` as its claim turnstile: exactly
//! one producer may hold the right to write the next ring slot. Shared
//! processors queue behind it; single-producer processors treat a failed
//! `try_acquire` as a second producer racing them.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};

/// Releases the fence on drop, including on panic or future cancellation.
pub(crate) struct Guard<'a>(&'a Fence);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        // Release pairs with the Acquire in `try_acquire`: slot writes made
        // while holding the fence are visible to the next holder.
        self.0.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Fence {
    flag: CachePadded<AtomicBool>,
}

impl Fence {
    /// Returns `None` if the fence is currently held.
    #[inline]
    pub(crate) fn try_acquire(&self) -> Option<Guard<'_>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Guard(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_is_exclusive() {
        let fence = Fence::default();

        let guard = fence.try_acquire().expect("free fence");
        assert!(fence.try_acquire().is_none());

        drop(guard);
        assert!(fence.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_guard_released_when_future_is_dropped() {
        let fence = Fence::default();
        {
            let fut = async {
                let _guard = fence.try_acquire().unwrap();
                std::future::pending::<()>().await;
            };
            let _ = tokio::time::timeout(tokio::time::Duration::from_millis(5), fut).await;
        }
        assert!(fence.try_acquire().is_some());
    }
}
