use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};

/// A ring sequence shared between tasks: the highest published slot, or the
/// last slot a consumer has finished with. `-1` means "nothing yet".
#[derive(Debug)]
pub(crate) struct Cursor {
    value: CachePadded<AtomicI64>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl Cursor {
    pub(crate) fn new(val: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(val)),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Publishes `val`. Everything written before is visible to readers that
    /// observe it through [`Cursor::get`].
    #[inline]
    pub(crate) fn set(&self, val: i64) {
        self.value.store(val, Ordering::Release)
    }

    /// Raises the cursor to `val` if it is lower, returning the previous value.
    #[inline]
    pub(crate) fn fetch_max(&self, val: i64) -> i64 {
        self.value.fetch_max(val, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cursor_starts_before_first_slot() {
        assert_eq!(Cursor::default().get(), -1);
        assert_eq!(Cursor::new(42).get(), 42);
    }

    #[test]
    fn test_cursor_set() {
        let cursor = Cursor::default();
        cursor.set(7);
        assert_eq!(cursor.get(), 7);
    }

    #[test]
    fn test_cursor_fetch_max_only_moves_forward() {
        let cursor = Cursor::new(10);

        assert_eq!(cursor.fetch_max(5), 10);
        assert_eq!(cursor.get(), 10);

        assert_eq!(cursor.fetch_max(15), 10);
        assert_eq!(cursor.get(), 15);
    }

    #[test]
    fn test_cursor_fetch_max_across_threads() {
        let cursor = Arc::new(Cursor::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cursor = cursor.clone();
                std::thread::spawn(move || {
                    for n in 0..1000 {
                        cursor.fetch_max(i * 1000 + n);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cursor.get(), 7999);
    }
}
