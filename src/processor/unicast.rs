//! Single-subscriber engine backed by an injected queue.
//!
//! Values beyond the subscriber's demand wait in the queue, which keeps them
//! across subscribers: after the active subscriber cancels, a later one may
//! attach and drain what is left. Delivery is serialized by a work-in-progress
//! counter, so `request`, `next` and terminal signals may all trigger a drain
//! from any task without two drains ever running at once.

use crate::config::{OverflowStrategy, UnicastConfig};
use crate::context::Context;
use crate::demand::Demand;
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::queue::{Queue, UnboundedQueue};
use crate::signal::Terminal;
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{Subscribable, Subscriber, Subscription, reject};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

/// Queues values for exactly one subscriber at a time.
pub struct Unicast<T> {
    inner: Arc<UnicastInner<T>>,
}

impl<T> Clone for Unicast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

type OverflowCallback<T> = Box<dyn Fn(T) + Send + Sync>;

struct UnicastInner<T> {
    queue: Mutex<Box<dyn Queue<T>>>,
    overflow: OverflowStrategy,
    on_overflow: Option<OverflowCallback<T>>,
    end_callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    current: Mutex<Option<Arc<UnicastSubscription<T>>>>,
    terminal: Mutex<Option<Terminal>>,
    /// Set after `terminal`, read before polling the queue.
    done: AtomicBool,
    wip: AtomicU64,
    /// Signalled whenever the queue loses an element or the engine stops.
    space: Notify,
    hooks: SinkHooks,
    disposed: AtomicBool,
}

struct UnicastSubscription<T> {
    actual: Arc<dyn Subscriber<T>>,
    demand: Demand,
    cancelled: AtomicBool,
    parent: Weak<UnicastInner<T>>,
}

impl<T: Send + 'static> UnicastSubscription<T> {
    /// Unhooks the subscriber and fires the sink's cancel callback. Returns
    /// `false` if it was already gone.
    fn leave(&self) -> bool {
        let Some(parent) = self.detach() else {
            return false;
        };
        tracing::debug!(queued = parent.queue.lock().len(), "unicast subscriber cancelled");
        parent.hooks.fire_cancel();
        true
    }

    fn detach(&self) -> Option<Arc<UnicastInner<T>>> {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return None;
        }
        let parent = self.parent.upgrade()?;
        {
            let mut current = parent.current.lock();
            if current
                .as_ref()
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), self))
            {
                *current = None;
            }
        }
        Some(parent)
    }
}

impl<T: Send + 'static> Subscription for UnicastSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self.leave() {
                self.actual.on_error(ProcessorError::InvalidRequest);
            }
            return;
        }
        self.demand.add(n);
        if let Some(parent) = self.parent.upgrade() {
            parent.hooks.fire_request(n);
            parent.drain();
        }
    }

    fn cancel(&self) {
        self.leave();
    }
}

impl<T: Send + 'static> UnicastInner<T> {
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            let current = self.current.lock().clone();
            if let Some(subscriber) = current {
                self.drain_into(&subscriber);
            }

            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    fn drain_into(&self, subscriber: &Arc<UnicastSubscription<T>>) {
        let requested = subscriber.demand.get();
        let mut emitted = 0u64;

        loop {
            if subscriber.cancelled.load(Ordering::Acquire) {
                break;
            }

            let done = self.done.load(Ordering::Acquire);
            let empty = self.queue.lock().is_empty();
            if done && empty {
                self.finish(subscriber);
                break;
            }
            if empty || emitted == requested {
                break;
            }

            let Some(value) = self.queue.lock().poll() else {
                break;
            };
            self.space.notify_waiters();
            subscriber.actual.on_next(value);
            emitted += 1;
        }

        if emitted > 0 {
            subscriber.demand.produced(emitted);
        }
    }

    /// Hands the recorded terminal to `subscriber` and releases the slot.
    fn finish(&self, subscriber: &Arc<UnicastSubscription<T>>) {
        let Some(terminal) = self.terminal.lock().clone() else {
            return;
        };
        if subscriber.detach().is_some() {
            terminal.deliver(&*subscriber.actual);
        }
    }

    /// Records the terminal. Returns `false` if one was already recorded.
    fn terminate(&self, terminal: Terminal) -> bool {
        {
            let mut slot = self.terminal.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(terminal);
        }
        self.done.store(true, Ordering::Release);
        let end = self.end_callback.lock().take();
        if let Some(end) = end {
            end();
        }
        self.space.notify_waiters();
        true
    }

    fn overflowed(&self, value: T) {
        tracing::debug!(strategy = ?self.overflow, "unicast queue full");
        match &self.on_overflow {
            Some(callback) => callback(value),
            None => hooks::next_dropped(value),
        }
    }
}

impl<T: Send + 'static> Unicast<T> {
    /// A processor over an unbounded queue.
    pub fn unbounded() -> Self {
        Self::build(UnicastConfig::new(UnboundedQueue::new()))
    }

    pub fn new(config: UnicastConfig<T>) -> Result<Self, ProcessorError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: UnicastConfig<T>) -> Self {
        let UnicastConfig {
            queue,
            end_callback,
            overflow,
            on_overflow,
        } = config;
        Self {
            inner: Arc::new(UnicastInner {
                queue: Mutex::new(queue),
                overflow,
                on_overflow,
                end_callback: Mutex::new(end_callback),
                current: Mutex::new(None),
                terminal: Mutex::new(None),
                done: AtomicBool::new(false),
                wip: AtomicU64::new(0),
                space: Notify::new(),
                hooks: SinkHooks::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn active(&self) -> Option<Arc<UnicastSubscription<T>>> {
        self.inner
            .current
            .lock()
            .clone()
            .filter(|s| !s.cancelled.load(Ordering::Acquire))
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Sink<T> for Unicast<T> {
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        let mut value = value;
        loop {
            if inner.done.load(Ordering::Acquire) {
                hooks::next_dropped(value);
                return Err(ProcessorError::Terminated);
            }

            let notified = inner.space.notified();
            let offered = inner.queue.lock().offer(value);
            let rejected = match offered {
                Ok(()) => {
                    inner.drain();
                    return Ok(());
                }
                Err(rejected) => rejected,
            };

            match inner.overflow {
                OverflowStrategy::Buffer => {
                    // Retried once the subscriber frees a slot.
                    value = rejected;
                    notified.await;
                }
                OverflowStrategy::Drop => {
                    inner.overflowed(rejected);
                    inner.drain();
                    return Ok(());
                }
                OverflowStrategy::DropOldest => {
                    let (evicted, refused) = {
                        let mut queue = inner.queue.lock();
                        let evicted = queue.poll();
                        (evicted, queue.offer(rejected).err())
                    };
                    for dropped in evicted.into_iter().chain(refused) {
                        inner.overflowed(dropped);
                    }
                    inner.drain();
                    return Ok(());
                }
                OverflowStrategy::Error => {
                    inner.overflowed(rejected);
                    return Err(ProcessorError::Overflow);
                }
                OverflowStrategy::Ignore => {
                    inner.overflowed(rejected);
                    inner.terminate(Terminal::Error(ProcessorError::Overflow));
                    inner.drain();
                    return Err(ProcessorError::Overflow);
                }
            }
        }
    }

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        if !self.inner.terminate(Terminal::Error(error.clone())) {
            hooks::error_dropped(&error);
            return Err(ProcessorError::Terminated);
        }
        self.inner.drain();
        Ok(())
    }

    async fn complete(&self) -> Result<(), ProcessorError> {
        if self.inner.terminate(Terminal::Complete) {
            self.inner.drain();
        }
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

    fn requested_from_downstream(&self) -> u64 {
        self.active().map_or(0, |s| s.demand.get())
    }
}

impl<T: Send + Sync + 'static> Subscribable<T> for Unicast<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let entry = Arc::new(UnicastSubscription {
            actual: subscriber.clone(),
            demand: Demand::default(),
            cancelled: AtomicBool::new(false),
            parent: Arc::downgrade(&self.inner),
        });

        {
            let mut current = self.inner.current.lock();
            if current
                .as_ref()
                .is_some_and(|c| !c.cancelled.load(Ordering::Acquire))
            {
                drop(current);
                tracing::debug!("unicast processor rejected a second subscriber");
                reject(&*subscriber, ProcessorError::MultipleSubscribers);
                return;
            }
            *current = Some(entry.clone());
        }

        self.inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry);
        self.inner.drain();
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Lifecycle for Unicast<T> {
    type Item = T;

    fn is_complete(&self) -> bool {
        matches!(*self.inner.terminal.lock(), Some(Terminal::Complete))
    }

    fn is_error(&self) -> bool {
        matches!(*self.inner.terminal.lock(), Some(Terminal::Error(_)))
    }

    fn terminal_error(&self) -> Option<ProcessorError> {
        self.inner
            .terminal
            .lock()
            .as_ref()
            .and_then(|t| t.error().cloned())
    }

    fn dispose(&self) {
        self.force_dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn force_dispose(&self) -> Vec<T> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let undelivered = self.inner.queue.lock().drain_all();
        tracing::debug!(undelivered = undelivered.len(), "unicast processor disposed");
        self.inner.terminate(Terminal::Error(ProcessorError::Disposed));
        self.inner.drain();
        self.inner.hooks.fire_cancel();
        self.inner.hooks.fire_dispose();
        undelivered
    }

    fn available_capacity(&self) -> i64 {
        let queue = self.inner.queue.lock();
        queue
            .capacity()
            .map_or(-1, |cap| cap.saturating_sub(queue.len()) as i64)
    }

    fn downstream_count(&self) -> i64 {
        i64::from(self.active().is_some())
    }

    fn is_serialized(&self) -> bool {
        true
    }
}
