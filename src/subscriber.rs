//! The consumer side of the demand protocol.
//!
//! A [`Subscribable`] hands each [`Subscriber`] a [`Subscription`] through
//! which the subscriber pulls values with `request(n)` and stops the flow
//! with `cancel()`. Callbacks are invoked serially per subscriber, never
//! concurrently, and never with more `on_next` calls than requested.

use crate::context::Context;
use crate::error::ProcessorError;
use std::sync::Arc;

/// Receives signals from a processor.
pub trait Subscriber<T>: Send + Sync + 'static {
    /// Called exactly once, before any other callback.
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, value: T);

    fn on_error(&self, error: ProcessorError);

    fn on_complete(&self);

    /// Context made visible to the producer.
    fn context(&self) -> Context {
        Context::empty()
    }
}

/// A subscriber's handle on the flow of values.
pub trait Subscription: Send + Sync {
    /// Adds `n` to the outstanding demand. `request(0)` cancels the
    /// subscription and signals [`ProcessorError::InvalidRequest`].
    fn request(&self, n: u64);

    /// Stops delivery. Idempotent.
    fn cancel(&self);
}

/// Something a [`Subscriber`] can attach to.
pub trait Subscribable<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);

    /// `true` when the source never emits more than one value, so a
    /// first-value consumer need not cancel it after the first value.
    fn emits_at_most_one(&self) -> bool {
        false
    }
}

/// Subscription handed to subscribers that are rejected or arrive after
/// the flow is over.
#[derive(Debug, Default)]
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Sends a single terminal to a subscriber that will never see values.
pub(crate) fn reject<T: 'static>(subscriber: &dyn Subscriber<T>, error: ProcessorError) {
    subscriber.on_subscribe(Arc::new(NoopSubscription));
    subscriber.on_error(error);
}

/// Completes a subscriber that will never see values.
pub(crate) fn complete_empty<T: 'static>(subscriber: &dyn Subscriber<T>) {
    subscriber.on_subscribe(Arc::new(NoopSubscription));
    subscriber.on_complete();
}
