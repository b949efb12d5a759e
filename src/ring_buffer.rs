//! Fixed-size slot storage for the fan-out engines.
//!
//! Each slot holds one [`Signal`] behind its own lock. Who may touch which
//! slot is decided outside this type: a producer writes slot `s` only after
//! every consumer cursor has moved past `s - capacity`, and consumers read
//! slot `s` only after the published cursor reached `s`. The per-slot lock
//! is therefore uncontended in steady state; it exists so that forced
//! disposal can take values out while workers are still winding down.

use crate::signal::Signal;
use parking_lot::Mutex;

#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    slots: Box<[Mutex<Option<Signal<T>>>]>,
    /// `capacity - 1`, maps a sequence to its slot.
    index_mask: usize,
}

impl<T> RingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is less than 2 or not a power of two. Callers
    /// validate the configured size first.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "capacity must be at least 2");
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            index_mask: capacity - 1,
        }
    }

    #[inline]
    fn slot(&self, sequence: i64) -> &Mutex<Option<Signal<T>>> {
        // Two's complement keeps negative sequences in range as well.
        &self.slots[(sequence as usize) & self.index_mask]
    }

    #[inline]
    pub(crate) fn write(&self, sequence: i64, signal: Signal<T>) {
        *self.slot(sequence).lock() = Some(signal);
    }

    /// Moves the signal out of its slot.
    #[inline]
    pub(crate) fn take(&self, sequence: i64) -> Option<Signal<T>> {
        self.slot(sequence).lock().take()
    }

    /// `true` if the slot holds a value rather than a terminal.
    #[inline]
    pub(crate) fn holds_value(&self, sequence: i64) -> bool {
        matches!(*self.slot(sequence).lock(), Some(Signal::Next(_)))
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copies the signal out, leaving it for other readers.
    #[inline]
    pub(crate) fn read(&self, sequence: i64) -> Option<Signal<T>> {
        self.slot(sequence).lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Terminal;

    #[test]
    fn test_ring_buffer_creation_and_capacity() {
        assert_eq!(RingBuffer::<u32>::new(2).capacity(), 2);
        assert_eq!(RingBuffer::<u32>::new(8).capacity(), 8);
        assert_eq!(RingBuffer::<u32>::new(1024).capacity(), 1024);
    }

    #[test]
    #[should_panic(expected = "capacity must be a power of 2")]
    fn test_ring_buffer_invalid_capacity_not_power_of_two() {
        RingBuffer::<u32>::new(3);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 2")]
    fn test_ring_buffer_invalid_capacity_too_small() {
        RingBuffer::<u32>::new(1);
    }

    #[test]
    fn test_sequences_wrap_around() {
        let rb = RingBuffer::<u32>::new(4);
        rb.write(0, Signal::Next(10));
        rb.write(3, Signal::Next(40));
        assert!(matches!(rb.read(0), Some(Signal::Next(10))));

        // Sequence 4 lands on the slot of sequence 0.
        rb.write(4, Signal::Next(50));
        assert!(matches!(rb.read(0), Some(Signal::Next(50))));
        assert!(matches!(rb.read(-1), Some(Signal::Next(40))));
    }

    #[test]
    fn test_take_empties_slot() {
        let rb = RingBuffer::<String>::new(2);
        rb.write(1, Signal::Next("a".to_string()));
        assert!(rb.holds_value(1));

        assert!(matches!(rb.take(1), Some(Signal::Next(s)) if s == "a"));
        assert!(rb.take(1).is_none());
        assert!(!rb.holds_value(1));
    }

    #[test]
    fn test_terminal_slots_are_not_values() {
        let rb = RingBuffer::<u8>::new(2);
        rb.write(0, Terminal::Complete.into());
        assert!(!rb.holds_value(0));
        assert!(matches!(rb.read(0), Some(Signal::Complete)));
    }
}
