//! Synchronous fan-out with no buffering.
//!
//! `next` delivers on the caller's task to every registered subscriber. A
//! subscriber that has no outstanding demand cannot be buffered for, so it is
//! cancelled and receives [`ProcessorError::IllegalDemand`]; the push itself
//! still succeeds.

use crate::context::Context;
use crate::demand::{Demand, as_capacity};
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::signal::Terminal;
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{NoopSubscription, Subscribable, Subscriber, Subscription};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Broadcasts each value to the subscribers registered at push time.
pub struct Direct<T> {
    inner: Arc<DirectInner<T>>,
}

impl<T> Clone for Direct<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DirectInner<T> {
    state: RwLock<DirectState<T>>,
    hooks: SinkHooks,
    disposed: AtomicBool,
}

struct DirectState<T> {
    subscribers: Vec<Arc<DirectSubscription<T>>>,
    terminal: Option<Terminal>,
}

struct DirectSubscription<T> {
    actual: Arc<dyn Subscriber<T>>,
    demand: Demand,
    cancelled: AtomicBool,
    parent: Weak<DirectInner<T>>,
}

impl<T: Send + 'static> DirectSubscription<T> {
    /// Marks the subscription cancelled and unregisters it. Returns `false`
    /// if it was already cancelled.
    fn detach(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent
                .state
                .write()
                .subscribers
                .retain(|s| !std::ptr::eq(Arc::as_ptr(s), self));
        }
        true
    }
}

impl<T: Send + 'static> Subscription for DirectSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self.detach() {
                self.actual.on_error(ProcessorError::InvalidRequest);
            }
            return;
        }
        self.demand.add(n);
        if let Some(parent) = self.parent.upgrade() {
            parent.hooks.fire_request(n);
        }
    }

    fn cancel(&self) {
        if self.detach() {
            tracing::trace!("direct subscriber cancelled");
        }
    }
}

impl<T: Clone + Send + 'static> Direct<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectInner {
                state: RwLock::new(DirectState {
                    subscribers: Vec::new(),
                    terminal: None,
                }),
                hooks: SinkHooks::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn snapshot(&self) -> Vec<Arc<DirectSubscription<T>>> {
        self.inner.state.read().subscribers.clone()
    }

    /// Records `terminal` and hands it to every subscriber. Returns `false`
    /// if a terminal was already recorded.
    fn terminate(&self, terminal: Terminal) -> bool {
        let subscribers = {
            let mut state = self.inner.state.write();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal.clone());
            mem::take(&mut state.subscribers)
        };
        for subscriber in subscribers {
            if !subscriber.cancelled.swap(true, Ordering::AcqRel) {
                terminal.deliver(&*subscriber.actual);
            }
        }
        true
    }
}

impl<T: Clone + Send + 'static> Default for Direct<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for Direct<T> {
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        let subscribers = {
            let state = self.inner.state.read();
            if state.terminal.is_some() {
                drop(state);
                hooks::next_dropped(value);
                return Err(ProcessorError::Terminated);
            }
            state.subscribers.clone()
        };

        if subscribers.is_empty() {
            hooks::next_dropped(value);
            return Ok(());
        }

        for subscriber in subscribers {
            if subscriber.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if subscriber.demand.try_take() {
                subscriber.actual.on_next(value.clone());
            } else if subscriber.detach() {
                tracing::debug!("direct subscriber has no demand, cancelling it");
                subscriber.actual.on_error(ProcessorError::IllegalDemand);
            }
        }
        Ok(())
    }

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        if self.terminate(Terminal::Error(error.clone())) {
            Ok(())
        } else {
            hooks::error_dropped(&error);
            Err(ProcessorError::Terminated)
        }
    }

    async fn complete(&self) -> Result<(), ProcessorError> {
        self.terminate(Terminal::Complete);
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
        self.snapshot()
            .iter()
            .map(|s| s.demand.get())
            .min()
            .unwrap_or(0)
    }
}

impl<T: Clone + Send + Sync + 'static> Subscribable<T> for Direct<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let entry = Arc::new(DirectSubscription {
            actual: subscriber.clone(),
            demand: Demand::default(),
            cancelled: AtomicBool::new(false),
            parent: Arc::downgrade(&self.inner),
        });

        {
            let mut state = self.inner.state.write();
            if let Some(terminal) = state.terminal.clone() {
                drop(state);
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                terminal.deliver(&*subscriber);
                return;
            }
            state.subscribers.push(entry.clone());
        }

        self.inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Lifecycle for Direct<T> {
    type Item = T;

    fn is_complete(&self) -> bool {
        matches!(self.inner.state.read().terminal, Some(Terminal::Complete))
    }

    fn is_error(&self) -> bool {
        matches!(self.inner.state.read().terminal, Some(Terminal::Error(_)))
    }

    fn terminal_error(&self) -> Option<ProcessorError> {
        self.inner
            .state
            .read()
            .terminal
            .as_ref()
            .and_then(|t| t.error().cloned())
    }

    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("direct processor disposed");
        self.terminate(Terminal::Error(ProcessorError::Disposed));
        self.inner.hooks.fire_cancel();
        self.inner.hooks.fire_dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn available_capacity(&self) -> i64 {
        as_capacity(self.requested_from_downstream())
    }

    fn downstream_count(&self) -> i64 {
        self.inner.state.read().subscribers.len() as i64
    }

    fn is_serialized(&self) -> bool {
        false
    }
}
