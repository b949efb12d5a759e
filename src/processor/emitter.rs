//! Multicast engine with a bounded warm-up buffer.
//!
//! Values are kept in a shared window `[head, tail)` of sequence numbers.
//! Each subscriber owns a cursor into that window and its own demand; the
//! window's head only moves past a value once every active subscriber has
//! consumed it. While nobody consumes, the window fills up to `buffer_size`
//! and the producer waits.
//!
//! The first subscriber to arrive while no other is active starts at the
//! head and so receives the retained window. Later subscribers start at the
//! tail and only see what is pushed after they subscribed.

use crate::config::{EmitterConfig, OverflowStrategy};
use crate::context::Context;
use crate::demand::Demand;
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::signal::Terminal;
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{Subscribable, Subscriber, Subscription, complete_empty};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EmitterInner<T> {
    state: Mutex<EmitterState<T>>,
    buffer_size: usize,
    auto_cancel: bool,
    overflow: OverflowStrategy,
    space: Notify,
    hooks: SinkHooks,
    disposed: AtomicBool,
}

struct EmitterState<T> {
    buffer: VecDeque<T>,
    /// Sequence number of `buffer[0]`.
    head: u64,
    subscribers: Vec<Arc<EmitterSubscription<T>>>,
    terminal: Option<Terminal>,
    /// Set by auto-cancel once the last subscriber left.
    cancelled: bool,
}

impl<T> EmitterState<T> {
    #[inline]
    fn tail(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    /// Empties the window without moving the tail.
    fn discard(&mut self) -> Vec<T> {
        self.head = self.tail();
        self.buffer.drain(..).collect()
    }
}

struct EmitterSubscription<T> {
    actual: Arc<dyn Subscriber<T>>,
    demand: Demand,
    /// Next sequence to deliver.
    cursor: AtomicU64,
    cancelled: AtomicBool,
    finished: AtomicBool,
    wip: AtomicU64,
    parent: Weak<EmitterInner<T>>,
}

enum Step<T> {
    Next(T),
    Terminal(Terminal),
    Idle,
}

impl<T: Clone + Send + 'static> Subscription for EmitterSubscription<T> {
    fn request(&self, n: u64) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                parent.leave(self);
                self.actual.on_error(ProcessorError::InvalidRequest);
            }
            return;
        }
        self.demand.add(n);
        parent.hooks.fire_request(n);
        parent.drain(self);
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.leave(self);
        }
    }
}

impl<T: Clone + Send + 'static> EmitterInner<T> {
    fn drain(&self, subscriber: &EmitterSubscription<T>) {
        if subscriber.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            loop {
                if subscriber.cancelled.load(Ordering::Acquire) {
                    break;
                }
                match self.step(subscriber) {
                    Step::Next(value) => {
                        self.evict();
                        subscriber.actual.on_next(value);
                    }
                    Step::Terminal(terminal) => {
                        if !subscriber.finished.swap(true, Ordering::AcqRel) {
                            subscriber.cancelled.store(true, Ordering::Release);
                            self.unregister(subscriber);
                            terminal.deliver(&*subscriber.actual);
                        }
                        break;
                    }
                    Step::Idle => break,
                }
            }

            let remaining = subscriber.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    /// Decides the next signal for `subscriber`, consuming demand and
    /// advancing its cursor when that signal is a value.
    fn step(&self, subscriber: &EmitterSubscription<T>) -> Step<T> {
        let state = self.state.lock();
        let mut cursor = subscriber.cursor.load(Ordering::Acquire);
        if cursor < state.head {
            // Values were evicted under `DropOldest`.
            cursor = state.head;
            subscriber.cursor.store(cursor, Ordering::Release);
        }

        if let Some(Terminal::Error(error)) = &state.terminal {
            return Step::Terminal(Terminal::Error(error.clone()));
        }
        if cursor < state.tail() {
            if !subscriber.demand.try_take() {
                return Step::Idle;
            }
            let index = (cursor - state.head) as usize;
            subscriber.cursor.store(cursor + 1, Ordering::Release);
            return match state.buffer.get(index) {
                Some(value) => Step::Next(value.clone()),
                None => Step::Idle,
            };
        }
        match &state.terminal {
            Some(terminal) => Step::Terminal(terminal.clone()),
            None => Step::Idle,
        }
    }

    /// Drops values every active subscriber has consumed.
    fn evict(&self) {
        let freed = {
            let mut state = self.state.lock();
            let Some(min) = state
                .subscribers
                .iter()
                .map(|s| s.cursor.load(Ordering::Acquire))
                .min()
            else {
                return;
            };
            let mut freed = 0usize;
            while state.head < min && state.buffer.pop_front().is_some() {
                state.head += 1;
                freed += 1;
            }
            freed
        };
        if freed > 0 {
            self.space.notify_waiters();
        }
    }

    fn unregister(&self, subscriber: &EmitterSubscription<T>) -> usize {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), subscriber));
        state.subscribers.len()
    }

    /// Handles a subscriber going away before its terminal.
    fn leave(&self, subscriber: &EmitterSubscription<T>) {
        let auto_cancelled = {
            let mut state = self.state.lock();
            state
                .subscribers
                .retain(|s| !std::ptr::eq(Arc::as_ptr(s), subscriber));
            let trigger = self.auto_cancel
                && state.subscribers.is_empty()
                && state.terminal.is_none()
                && !state.cancelled;
            if trigger {
                state.cancelled = true;
                state.discard();
            }
            trigger
        };

        if auto_cancelled {
            tracing::debug!("emitter auto-cancelled: last subscriber left");
            self.hooks.fire_cancel();
            self.space.notify_waiters();
        } else {
            self.evict();
        }
    }

    fn drain_all(&self) {
        let subscribers = self.state.lock().subscribers.clone();
        for subscriber in subscribers {
            self.drain(&subscriber);
        }
    }

    fn overflowed(&self, value: T) {
        tracing::debug!(strategy = ?self.overflow, "emitter buffer full");
        hooks::next_dropped(value);
    }
}

impl<T: Clone + Send + Sync + 'static> Emitter<T> {
    /// An emitter with the default configuration.
    pub fn new() -> Self {
        Self::build(EmitterConfig::default())
    }

    pub fn with_config(config: EmitterConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EmitterConfig) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                state: Mutex::new(EmitterState {
                    buffer: VecDeque::with_capacity(config.buffer_size.min(1024)),
                    head: 0,
                    subscribers: Vec::new(),
                    terminal: None,
                    cancelled: false,
                }),
                buffer_size: config.buffer_size,
                auto_cancel: config.auto_cancel,
                overflow: config.overflow,
                space: Notify::new(),
                hooks: SinkHooks::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Records `terminal` unless one exists or the emitter was auto-cancelled.
    /// Errors discard the window so they reach subscribers immediately.
    fn terminate(&self, terminal: Terminal) -> Result<(), ProcessorError> {
        {
            let mut state = self.inner.state.lock();
            if state.terminal.is_some() {
                return Err(ProcessorError::Terminated);
            }
            if state.cancelled {
                return Err(ProcessorError::Cancelled);
            }
            if terminal.is_error() {
                state.discard();
            }
            state.terminal = Some(terminal);
        }
        self.inner.space.notify_waiters();
        self.inner.drain_all();
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for Emitter<T> {
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        loop {
            let notified = inner.space.notified();
            {
                let mut state = inner.state.lock();
                if state.cancelled {
                    drop(state);
                    hooks::next_dropped(value);
                    return Err(ProcessorError::Cancelled);
                }
                if state.terminal.is_some() {
                    drop(state);
                    hooks::next_dropped(value);
                    return Err(ProcessorError::Terminated);
                }
                if state.buffer.len() < inner.buffer_size {
                    state.buffer.push_back(value);
                    break;
                }
                match inner.overflow {
                    OverflowStrategy::Drop => {
                        drop(state);
                        inner.overflowed(value);
                        return Ok(());
                    }
                    OverflowStrategy::Error => {
                        drop(state);
                        inner.overflowed(value);
                        return Err(ProcessorError::Overflow);
                    }
                    OverflowStrategy::DropOldest => {
                        let evicted = state.buffer.pop_front();
                        state.head += 1;
                        state.buffer.push_back(value);
                        drop(state);
                        if let Some(evicted) = evicted {
                            inner.overflowed(evicted);
                        }
                        break;
                    }
                    OverflowStrategy::Buffer | OverflowStrategy::Ignore => {}
                }
            }
            notified.await;
        }

        inner.drain_all();
        Ok(())
    }

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        self.terminate(Terminal::Error(error.clone()))
            .inspect_err(|_| hooks::error_dropped(&error))
    }

    async fn complete(&self) -> Result<(), ProcessorError> {
        let _ = self.terminate(Terminal::Complete);
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
        self.inner
            .state
            .lock()
            .subscribers
            .iter()
            .map(|s| s.demand.get())
            .min()
            .unwrap_or(0)
    }
}

impl<T: Clone + Send + Sync + 'static> Subscribable<T> for Emitter<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let entry = Arc::new(EmitterSubscription {
            actual: subscriber.clone(),
            demand: Demand::default(),
            cursor: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            wip: AtomicU64::new(0),
            parent: Arc::downgrade(&self.inner),
        });

        {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                drop(state);
                complete_empty(&*subscriber);
                return;
            }
            let start = if state.subscribers.is_empty() {
                state.head
            } else {
                state.tail()
            };
            entry.cursor.store(start, Ordering::Release);
            state.subscribers.push(entry.clone());
        }

        self.inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry.clone());
        self.inner.drain(&entry);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Lifecycle for Emitter<T> {
    type Item = T;

    fn is_complete(&self) -> bool {
        matches!(self.inner.state.lock().terminal, Some(Terminal::Complete))
    }

    fn is_error(&self) -> bool {
        matches!(self.inner.state.lock().terminal, Some(Terminal::Error(_)))
    }

    fn terminal_error(&self) -> Option<ProcessorError> {
        self.inner
            .state
            .lock()
            .terminal
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
        let undelivered = {
            let mut state = self.inner.state.lock();
            let undelivered = state.discard();
            if state.terminal.is_none() {
                state.terminal = Some(Terminal::Error(ProcessorError::Disposed));
            }
            undelivered
        };
        tracing::debug!(undelivered = undelivered.len(), "emitter disposed");
        self.inner.space.notify_waiters();
        self.inner.drain_all();
        self.inner.hooks.fire_cancel();
        self.inner.hooks.fire_dispose();
        undelivered
    }

    fn available_capacity(&self) -> i64 {
        let state = self.inner.state.lock();
        self.inner.buffer_size.saturating_sub(state.buffer.len()) as i64
    }

    fn downstream_count(&self) -> i64 {
        self.inner.state.lock().subscribers.len() as i64
    }

    fn is_serialized(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestSubscriber;
    use tokio::time::{Duration, timeout};

    fn emitter(
        buffer_size: usize,
        auto_cancel: bool,
        overflow: OverflowStrategy,
    ) -> Emitter<i32> {
        Emitter::with_config(EmitterConfig {
            buffer_size,
            auto_cancel,
            overflow,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_subscriber_gets_warm_up_buffer_only() {
        let emitter = Emitter::<i32>::new();
        for i in 1..=3 {
            emitter.next(i).await.unwrap();
        }

        let first = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(first.clone());
        assert_eq!(first.values(), vec![1, 2, 3]);

        let second = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(second.clone());
        assert!(second.values().is_empty());

        emitter.next(4).await.unwrap();
        assert_eq!(first.values(), vec![1, 2, 3, 4]);
        assert_eq!(second.values(), vec![4]);
    }

    #[tokio::test]
    async fn test_second_subscriber_waits_for_next_push() {
        let emitter = emitter(3, true, OverflowStrategy::Ignore);
        for i in 1..=3 {
            emitter.next(i).await.unwrap();
        }
        assert_eq!(emitter.available_capacity(), 0);

        let s1 = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(s1.clone());
        assert_eq!(s1.values(), vec![1, 2, 3]);

        let s2 = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(s2.clone());
        assert!(s2.values().is_empty());

        emitter.next(4).await.unwrap();
        assert_eq!(s1.values(), vec![1, 2, 3, 4]);
        assert_eq!(s2.values(), vec![4]);
    }

    #[tokio::test]
    async fn test_per_subscriber_demand() {
        let emitter = Emitter::<i32>::new();
        let slow = TestSubscriber::<i32>::new(1);
        let fast = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(slow.clone());
        emitter.subscribe(fast.clone());

        for i in 1..=3 {
            emitter.next(i).await.unwrap();
        }
        assert_eq!(slow.values(), vec![1]);
        assert_eq!(fast.values(), vec![1, 2, 3]);
        // The slow subscriber still pins values 2 and 3.
        assert_eq!(emitter.available_capacity(), 254);

        slow.request(5);
        assert_eq!(slow.values(), vec![1, 2, 3]);
        assert_eq!(emitter.available_capacity(), 256);
    }

    #[tokio::test]
    async fn test_producer_waits_on_full_buffer() {
        let emitter = emitter(2, true, OverflowStrategy::Ignore);
        emitter.next(1).await.unwrap();
        emitter.next(2).await.unwrap();

        let producer = emitter.clone();
        let mut blocked = tokio::spawn(async move { producer.next(3).await });
        assert!(
            timeout(Duration::from_millis(50), &mut blocked)
                .await
                .is_err(),
            "push should wait while the buffer is full"
        );

        let sub = TestSubscriber::<i32>::new(1);
        emitter.subscribe(sub.clone());
        timeout(Duration::from_secs(2), blocked)
            .await
            .expect("push should resume once a value is consumed")
            .unwrap()
            .unwrap();

        sub.request(2);
        assert_eq!(sub.values(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_auto_cancel_completes_late_subscribers() {
        let emitter = Emitter::<i32>::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let c = cancelled.clone();
        emitter.on_cancel(Box::new(move || c.store(true, Ordering::Relaxed)));

        let sub = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(sub.clone());
        emitter.next(1).await.unwrap();
        sub.cancel();

        assert!(cancelled.load(Ordering::Relaxed));
        assert!(emitter.is_cancelled());
        assert!(matches!(
            emitter.next(2).await,
            Err(ProcessorError::Cancelled)
        ));

        let late = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(late.clone());
        assert!(late.values().is_empty());
        assert!(late.is_completed());
    }

    #[tokio::test]
    #[should_panic(expected = "error dropped without a receiver")]
    async fn test_error_after_auto_cancel_reaches_dropped_error_hook() {
        let emitter = Emitter::<i32>::new();
        let sub = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(sub.clone());
        emitter.next(1).await.unwrap();
        sub.cancel();
        assert!(emitter.is_cancelled());

        let _ = emitter.error(ProcessorError::Overflow).await;
    }

    #[tokio::test]
    async fn test_without_auto_cancel_keeps_running() {
        let emitter = emitter(8, false, OverflowStrategy::Ignore);
        let sub = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(sub.clone());
        sub.cancel();

        emitter.next(7).await.unwrap();
        let next = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(next.clone());
        assert_eq!(next.values(), vec![7]);
    }

    #[tokio::test]
    async fn test_error_is_delivered_eagerly() {
        let emitter = Emitter::<i32>::new();
        let sub = TestSubscriber::<i32>::new(0);
        emitter.subscribe(sub.clone());
        emitter.next(1).await.unwrap();
        emitter.next(2).await.unwrap();

        emitter.error(ProcessorError::Overflow).await.unwrap();
        assert!(sub.values().is_empty());
        assert!(matches!(sub.error(), Some(ProcessorError::Overflow)));
    }

    #[tokio::test]
    async fn test_completion_waits_for_each_subscriber() {
        let emitter = Emitter::<i32>::new();
        let sub = TestSubscriber::<i32>::new(1);
        emitter.subscribe(sub.clone());
        emitter.next(1).await.unwrap();
        emitter.next(2).await.unwrap();
        emitter.complete().await.unwrap();

        assert_eq!(sub.values(), vec![1]);
        assert!(sub.terminal().is_none());
        sub.request(1);
        assert_eq!(sub.values(), vec![1, 2]);
        assert!(sub.is_completed());
        assert_eq!(sub.terminal_count(), 1);
    }

    #[tokio::test]
    async fn test_retained_buffer_survives_completion() {
        let emitter = Emitter::<i32>::new();
        emitter.next(1).await.unwrap();
        emitter.complete().await.unwrap();

        let sub = TestSubscriber::<i32>::unbounded();
        emitter.subscribe(sub.clone());
        assert_eq!(sub.values(), vec![1]);
        assert!(sub.is_completed());
    }

    #[tokio::test]
    async fn test_overflow_strategies_on_full_buffer() {
        let dropping = emitter(1, true, OverflowStrategy::Drop);
        dropping.next(1).await.unwrap();
        assert!(dropping.next(2).await.is_ok());

        let failing = emitter(1, true, OverflowStrategy::Error);
        failing.next(1).await.unwrap();
        assert!(matches!(
            failing.next(2).await,
            Err(ProcessorError::Overflow)
        ));

        let oldest = emitter(2, true, OverflowStrategy::DropOldest);
        for i in 1..=3 {
            oldest.next(i).await.unwrap();
        }

        let cases = [(dropping, vec![1]), (failing, vec![1]), (oldest, vec![2, 3])];
        for (processor, expected) in cases {
            let sub = TestSubscriber::<i32>::unbounded();
            processor.subscribe(sub.clone());
            assert_eq!(sub.values(), expected);
        }
    }

    #[tokio::test]
    async fn test_force_dispose_returns_buffer() {
        let emitter = Emitter::<i32>::new();
        let sub = TestSubscriber::<i32>::new(0);
        emitter.subscribe(sub.clone());
        for i in 1..=3 {
            emitter.next(i).await.unwrap();
        }

        assert_eq!(emitter.force_dispose(), vec![1, 2, 3]);
        assert!(emitter.is_disposed());
        assert!(matches!(sub.error(), Some(ProcessorError::Disposed)));
        assert!(matches!(
            emitter.next(4).await,
            Err(ProcessorError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_zero_buffer_is_rejected() {
        let result = Emitter::<i32>::with_config(EmitterConfig {
            buffer_size: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(ProcessorError::InvalidConfig(_))));
    }
}
