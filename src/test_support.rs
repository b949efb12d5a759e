//! Recording subscriber used by the engine tests.

use crate::context::Context;
use crate::error::ProcessorError;
use crate::signal::Terminal;
use crate::subscriber::{Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};

const WAIT: Duration = Duration::from_secs(2);

pub(crate) struct TestSubscriber<T> {
    initial_request: u64,
    values: Mutex<Vec<T>>,
    terminal: Mutex<Option<Terminal>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    subscribed: AtomicUsize,
    terminals: AtomicUsize,
    context: Context,
    notify: Notify,
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    /// Requests `initial_request` on subscribe; `0` requests nothing.
    pub(crate) fn new(initial_request: u64) -> Arc<Self> {
        Self::with_context(initial_request, Context::empty())
    }

    pub(crate) fn unbounded() -> Arc<Self> {
        Self::new(u64::MAX)
    }

    pub(crate) fn with_context(initial_request: u64, context: Context) -> Arc<Self> {
        Arc::new(Self {
            initial_request,
            values: Mutex::new(Vec::new()),
            terminal: Mutex::new(None),
            subscription: Mutex::new(None),
            subscribed: AtomicUsize::new(0),
            terminals: AtomicUsize::new(0),
            context,
            notify: Notify::new(),
        })
    }

    pub(crate) fn request(&self, n: u64) {
        let subscription = self.subscription.lock().clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    pub(crate) fn cancel(&self) {
        let subscription = self.subscription.lock().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub(crate) fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    pub(crate) fn terminal(&self) -> Option<Terminal> {
        self.terminal.lock().clone()
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self.terminal(), Some(Terminal::Complete))
    }

    pub(crate) fn error(&self) -> Option<ProcessorError> {
        self.terminal().and_then(|t| t.error().cloned())
    }

    pub(crate) fn terminal_count(&self) -> usize {
        self.terminals.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Waits until at least `n` values arrived.
    pub(crate) async fn await_values(&self, n: usize) -> Vec<T> {
        self.await_until(|s| s.values.lock().len() >= n).await;
        self.values()
    }

    pub(crate) async fn await_terminal(&self) -> Terminal {
        self.await_until(|s| s.terminal.lock().is_some()).await;
        self.terminal().unwrap()
    }

    async fn await_until(&self, ready: impl Fn(&Self) -> bool) {
        timeout(WAIT, async {
            loop {
                let notified = self.notify.notified();
                if ready(self) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("subscriber did not observe the expected signals in time");
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *self.subscription.lock() = Some(subscription.clone());
        self.subscribed.fetch_add(1, Ordering::AcqRel);
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, value: T) {
        self.values.lock().push(value);
        self.notify.notify_waiters();
    }

    fn on_error(&self, error: ProcessorError) {
        self.terminals.fetch_add(1, Ordering::AcqRel);
        *self.terminal.lock() = Some(Terminal::Error(error));
        self.notify.notify_waiters();
    }

    fn on_complete(&self) {
        self.terminals.fetch_add(1, Ordering::AcqRel);
        *self.terminal.lock() = Some(Terminal::Complete);
        self.notify.notify_waiters();
    }

    fn context(&self) -> Context {
        self.context.clone()
    }
}
