//! Captures the first value (or the terminal) of a stream and replays it.
//!
//! The engine settles exactly once: on its first value, on completion
//! without a value, or on an error. Every subscriber, early or late,
//! receives the settled outcome: a value followed by completion once it has
//! requested at least one element, or the terminal signal right away.

use crate::config::FirstConfig;
use crate::context::Context;
use crate::demand::UNBOUNDED;
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{Subscribable, Subscriber, Subscription};
use crate::wait::WaitStrategy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct First<T> {
    inner: Arc<FirstInner<T>>,
}

impl<T> Clone for First<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug, Clone)]
enum Outcome<T> {
    Value(T),
    Empty,
    Error(ProcessorError),
}

struct FirstInner<T> {
    state: Mutex<FirstState<T>>,
    wait: WaitStrategy,
    settled: Notify,
    hooks: SinkHooks,
    disposed: AtomicBool,
    /// Subscription on the source this engine is attached to.
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
}

struct FirstState<T> {
    outcome: Option<Outcome<T>>,
    subscribers: Vec<Arc<FirstSubscription<T>>>,
}

struct FirstSubscription<T> {
    actual: Arc<dyn Subscriber<T>>,
    requested: AtomicBool,
    done: AtomicBool,
    parent: Weak<FirstInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Subscription for FirstSubscription<T> {
    fn request(&self, n: u64) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if n == 0 {
            if !self.done.swap(true, Ordering::AcqRel) {
                parent.remove(self);
                self.actual.on_error(ProcessorError::InvalidRequest);
            }
            return;
        }
        if !self.requested.swap(true, Ordering::AcqRel) {
            parent.hooks.fire_request(n);
        }
        parent.emit(self);
    }

    fn cancel(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove(self);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FirstInner<T> {
    fn remove(&self, subscriber: &FirstSubscription<T>) {
        self.state
            .lock()
            .subscribers
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), subscriber));
    }

    /// Hands the outcome to `subscriber` if it is settled and deliverable.
    fn emit(&self, subscriber: &FirstSubscription<T>) {
        let outcome = {
            let state = self.state.lock();
            match &state.outcome {
                Some(Outcome::Value(_)) if !subscriber.requested.load(Ordering::Acquire) => return,
                Some(outcome) => outcome.clone(),
                None => return,
            }
        };
        if subscriber.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.remove(subscriber);
        match outcome {
            Outcome::Value(value) => {
                subscriber.actual.on_next(value);
                subscriber.actual.on_complete();
            }
            Outcome::Empty => subscriber.actual.on_complete(),
            Outcome::Error(error) => subscriber.actual.on_error(error),
        }
    }

    /// Records `outcome` if nothing was recorded yet.
    fn settle(&self, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        let subscribers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return Err(outcome);
            }
            state.outcome = Some(outcome);
            state.subscribers.clone()
        };
        self.settled.notify_waiters();
        for subscriber in subscribers {
            self.emit(&subscriber);
        }
        Ok(())
    }

    fn on_value(&self, value: T) {
        if let Err(Outcome::Value(value)) = self.settle(Outcome::Value(value)) {
            hooks::next_dropped(value);
        }
    }

    fn on_error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        match self.settle(Outcome::Error(error)) {
            Ok(()) => Ok(()),
            Err(_) if self.disposed.load(Ordering::Acquire) => Err(ProcessorError::Disposed),
            Err(Outcome::Error(error)) => {
                hooks::error_dropped(&error);
                Err(ProcessorError::Terminated)
            }
            Err(_) => Err(ProcessorError::Terminated),
        }
    }

    fn on_complete(&self) {
        let _ = self.settle(Outcome::Empty);
    }

    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.cancel();
        }
    }

    fn result(&self) -> Result<Option<T>, ProcessorError> {
        match &self.state.lock().outcome {
            Some(Outcome::Value(value)) => Ok(Some(value.clone())),
            Some(Outcome::Error(error)) => Err(error.clone()),
            Some(Outcome::Empty) | None => Ok(None),
        }
    }
}

/// Feeds a source's signals into a [`First`].
struct Upstream<T> {
    target: Weak<FirstInner<T>>,
    /// The source emits at most one value, so it need not be cancelled.
    single: bool,
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for Upstream<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let Some(target) = self.target.upgrade() else {
            subscription.cancel();
            return;
        };
        if target.disposed.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        *target.upstream.lock() = Some(subscription.clone());
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: T) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if !self.single {
            target.cancel_upstream();
        }
        target.on_value(value);
    }

    fn on_error(&self, error: ProcessorError) {
        if let Some(target) = self.target.upgrade() {
            target.upstream.lock().take();
            let _ = target.on_error(error);
        }
    }

    fn on_complete(&self) {
        if let Some(target) = self.target.upgrade() {
            target.upstream.lock().take();
            target.on_complete();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> First<T> {
    pub fn new() -> Self {
        Self::with_config(FirstConfig::default())
    }

    pub fn with_config(config: FirstConfig) -> Self {
        Self {
            inner: Arc::new(FirstInner {
                state: Mutex::new(FirstState {
                    outcome: None,
                    subscribers: Vec::new(),
                }),
                wait: config.wait_strategy,
                settled: Notify::new(),
                hooks: SinkHooks::default(),
                disposed: AtomicBool::new(false),
                upstream: Mutex::new(None),
            }),
        }
    }

    /// Subscribes a new engine to `source`.
    ///
    /// The source is cancelled after its first value unless it reports
    /// [`Subscribable::emits_at_most_one`].
    pub fn attached<S>(source: &S) -> Self
    where
        S: Subscribable<T> + ?Sized,
    {
        let first = Self::new();
        first.attach(source);
        first
    }

    pub fn attach<S>(&self, source: &S)
    where
        S: Subscribable<T> + ?Sized,
    {
        source.subscribe(Arc::new(Upstream {
            target: Arc::downgrade(&self.inner),
            single: source.emits_at_most_one(),
        }));
    }

    /// Waits until the engine settles.
    ///
    /// Returns the value, `None` on completion without one, or the error.
    pub async fn block(&self) -> Result<Option<T>, ProcessorError> {
        let inner = &self.inner;
        let never = CancellationToken::new();
        inner
            .wait
            .wait_until(&inner.settled, &never, || {
                inner.state.lock().outcome.is_some()
            })
            .await?;
        inner.result()
    }

    /// Like [`First::block`], failing with [`ProcessorError::Timeout`] when
    /// nothing settles within `timeout`.
    pub async fn block_timeout(&self, timeout: Duration) -> Result<Option<T>, ProcessorError> {
        match tokio::time::timeout(timeout, self.block()).await {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::Timeout(timeout)),
        }
    }

    /// The captured value, without waiting.
    pub fn peek(&self) -> Option<T> {
        match &self.inner.state.lock().outcome {
            Some(Outcome::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_valued(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Value(_)))
    }
}

impl<T: Clone + Send + Sync + 'static> Default for First<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for First<T> {
    /// Only the first value is kept; later ones go to the dropped-value hook.
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        let terminated = matches!(
            self.inner.state.lock().outcome,
            Some(Outcome::Empty | Outcome::Error(_))
        );
        if terminated {
            hooks::next_dropped(value);
            return Err(ProcessorError::Terminated);
        }
        self.inner.on_value(value);
        Ok(())
    }

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        self.inner.on_error(error)
    }

    async fn complete(&self) -> Result<(), ProcessorError> {
        self.inner.on_complete();
        Ok(())
    }

    fn on_request(&self, callback: RequestCallback) {
        self.inner
            .hooks
            .set_on_request(callback, self.requested_from_downstream());
    }

    fn on_cancel(&self, callback: TeardownCallback) {
        self.inner.hooks.set_on_cancel(callback);
    }

    fn on_dispose(&self, callback: TeardownCallback) {
        self.inner.hooks.set_on_dispose(callback);
    }

    fn current_context(&self) -> Context {
        self.inner.hooks.context()
    }

    fn is_cancelled(&self) -> bool {
        self.inner.hooks.is_cancelled()
    }

    /// `1` while unsettled with a subscriber waiting for a value.
    fn requested_from_downstream(&self) -> u64 {
        let state = self.inner.state.lock();
        let waiting = state
            .subscribers
            .iter()
            .any(|s| s.requested.load(Ordering::Acquire));
        u64::from(state.outcome.is_none() && waiting)
    }
}

impl<T: Clone + Send + Sync + 'static> Subscribable<T> for First<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let entry = Arc::new(FirstSubscription {
            actual: subscriber.clone(),
            requested: AtomicBool::new(false),
            done: AtomicBool::new(false),
            parent: Arc::downgrade(&self.inner),
        });
        self.inner.state.lock().subscribers.push(entry.clone());

        self.inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry.clone());
        self.inner.emit(&entry);
    }

    fn emits_at_most_one(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Lifecycle for First<T> {
    type Item = T;

    fn is_complete(&self) -> bool {
        matches!(
            self.inner.state.lock().outcome,
            Some(Outcome::Value(_) | Outcome::Empty)
        )
    }

    fn is_error(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Outcome::Error(_)))
    }

    fn terminal_error(&self) -> Option<ProcessorError> {
        match &self.inner.state.lock().outcome {
            Some(Outcome::Error(error)) => Some(error.clone()),
            _ => None,
        }
    }

    fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancel_upstream();
        let _ = inner.settle(Outcome::Error(ProcessorError::Disposed));
        inner.hooks.fire_cancel();
        inner.hooks.fire_dispose();
        tracing::debug!("first-value processor disposed");
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn available_capacity(&self) -> i64 {
        if self.is_terminated() { 0 } else { 1 }
    }

    fn downstream_count(&self) -> i64 {
        self.inner.state.lock().subscribers.len() as i64
    }

    fn is_serialized(&self) -> bool {
        false
    }
}
