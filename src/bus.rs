//! The shared state behind a ring-backed engine.
//!
//! A `RingBus` couples the slot storage with one published cursor and any
//! number of consumer cursors. Producers take turns through a claim
//! turnstile, wait until the slowest consumer is less than a full ring
//! behind, write the slot and move the published cursor. Consumers read up
//! to the published cursor and report progress by advancing their own.

use crate::cursor::Cursor;
use crate::fence::{self, Fence};
use crate::ring_buffer::RingBuffer;
use crate::signal::Signal;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

/// Exclusive right to publish the next sequence.
///
/// Dropping it, on success or when the owning future is cancelled, lets the
/// next waiting producer in.
pub(crate) struct Claim<'a> {
    sequence: i64,
    guard: Option<fence::Guard<'a>>,
    turnstile: &'a Notify,
}

impl Claim<'_> {
    #[inline]
    pub(crate) fn sequence(&self) -> i64 {
        self.sequence
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        // Open the fence first so the woken producer finds it free.
        drop(self.guard.take());
        self.turnstile.notify_one();
    }
}

#[derive(Debug)]
pub(crate) struct RingBus<T> {
    pub(crate) buffer: RingBuffer<T>,
    claim_fence: Fence,
    claim_notify: Notify,
    published: Cursor,
    ids: AtomicU64,
    consumers: papaya::HashMap<u64, Cursor>,
    /// Woken when a sequence is published.
    pub(crate) consumer_notify: Notify,
    /// Woken when a consumer moves or leaves.
    pub(crate) producer_notify: Notify,
}

impl<T> RingBus<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
            claim_fence: Fence::default(),
            claim_notify: Notify::new(),
            published: Cursor::default(),
            ids: AtomicU64::new(0),
            consumers: papaya::HashMap::new(),
            consumer_notify: Notify::new(),
            producer_notify: Notify::new(),
        }
    }

    /// Waits for the turnstile.
    pub(crate) async fn claim(&self) -> Claim<'_> {
        loop {
            let notified = self.claim_notify.notified();
            if let Some(claim) = self.try_claim() {
                return claim;
            }
            notified.await;
        }
    }

    /// Returns `None` if another producer holds the turnstile.
    pub(crate) fn try_claim(&self) -> Option<Claim<'_>> {
        let guard = self.claim_fence.try_acquire()?;
        Some(Claim {
            sequence: self.published.get() + 1,
            guard: Some(guard),
            turnstile: &self.claim_notify,
        })
    }

    /// Registers a consumer that has finished with everything up to `start`.
    pub(crate) fn register(&self, start: i64) -> u64 {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.consumers.pin().insert(id, Cursor::new(start));
        id
    }

    /// Removes a consumer and returns its last position.
    pub(crate) fn deregister(&self, id: u64) -> Option<i64> {
        let position = self.consumers.pin().remove(&id).map(Cursor::get);
        self.producer_notify.notify_waiters();
        position
    }

    pub(crate) fn position(&self, id: u64) -> Option<i64> {
        self.consumers.pin().get(&id).map(Cursor::get)
    }

    /// Marks everything up to `sequence` as consumed by `id`.
    pub(crate) fn advance(&self, id: u64, sequence: i64) {
        if let Some(cursor) = self.consumers.pin().get(&id) {
            cursor.fetch_max(sequence);
        }
        self.producer_notify.notify_waiters();
    }

    /// Position of the slowest consumer.
    pub(crate) fn min_gating(&self) -> Option<i64> {
        self.consumers.pin().values().map(Cursor::get).min()
    }

    #[inline]
    pub(crate) fn published(&self) -> i64 {
        self.published.get()
    }

    /// `true` if writing `sequence` would not overwrite an unconsumed slot.
    pub(crate) fn has_capacity(&self, sequence: i64) -> bool {
        match self.min_gating() {
            Some(min) => sequence - min <= self.buffer.capacity() as i64,
            None => true,
        }
    }

    pub(crate) fn remaining_capacity(&self) -> i64 {
        let capacity = self.buffer.capacity() as i64;
        match self.min_gating() {
            Some(min) => (capacity - (self.published() - min)).max(0),
            None => capacity,
        }
    }

    /// Writes `signal` at `claim` and makes it visible to consumers.
    pub(crate) fn publish(&self, claim: Claim<'_>, signal: Signal<T>) {
        let sequence = claim.sequence();
        self.buffer.write(sequence, signal);
        self.published.set(sequence);
        drop(claim);
        self.consumer_notify.notify_waiters();
    }
}
