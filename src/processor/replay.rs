//! Replay cache: every subscriber first receives the retained history.
//!
//! History entries carry a monotonically increasing index. Size and age
//! bounds move the *visible start* forward, which decides what a new
//! subscriber is replayed; an entry is physically dropped only once it is
//! behind the visible start *and* every subscriber's cursor, so a lagging
//! subscriber never loses values it was already promised.
//!
//! A replay cache never rejects values, so the configured overflow strategy
//! has no effect and `available_capacity` is `-1`.

use crate::config::{ReplaySizeConfig, ReplayTimeConfig};
use crate::context::Context;
use crate::demand::Demand;
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::signal::Terminal;
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{Subscribable, Subscriber, Subscription};
use crate::time::TimeSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub struct Replay<T> {
    inner: Arc<ReplayInner<T>>,
}

impl<T> Clone for Replay<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Which entries stay visible to new subscribers.
#[derive(Debug, Clone)]
struct Retention {
    /// `None` keeps every entry.
    history_size: Option<usize>,
    max_age: Option<(Duration, Arc<dyn TimeSource>)>,
}

impl Retention {
    fn now(&self) -> Duration {
        self.max_age
            .as_ref()
            .map_or(Duration::ZERO, |(_, clock)| clock.now())
    }
}

struct ReplayInner<T> {
    state: Mutex<ReplayState<T>>,
    retention: Retention,
    hooks: SinkHooks,
    disposed: AtomicBool,
}

struct Entry<T> {
    index: u64,
    value: T,
    timestamp: Duration,
}

struct ReplayState<T> {
    entries: VecDeque<Entry<T>>,
    next_index: u64,
    visible_start: u64,
    subscribers: Vec<Arc<ReplaySubscription<T>>>,
    terminal: Option<Terminal>,
}

impl<T> ReplayState<T> {
    fn front_index(&self) -> u64 {
        self.entries.front().map_or(self.next_index, |e| e.index)
    }

    fn entry(&self, index: u64) -> Option<&Entry<T>> {
        let offset = index.checked_sub(self.front_index())?;
        self.entries.get(usize::try_from(offset).ok()?)
    }

    fn append(&mut self, value: T, timestamp: Duration) {
        self.entries.push_back(Entry {
            index: self.next_index,
            value,
            timestamp,
        });
        self.next_index += 1;
    }

    /// Applies size and age bounds to the visible window.
    fn expire(&mut self, retention: &Retention, now: Duration) {
        if let Some(limit) = retention.history_size {
            let limit = limit as u64;
            if self.next_index - self.visible_start > limit {
                self.visible_start = self.next_index - limit;
            }
        }
        if let Some((max_age, _)) = &retention.max_age {
            while self.visible_start < self.next_index {
                let expired = self
                    .entry(self.visible_start)
                    .is_some_and(|e| now.saturating_sub(e.timestamp) > *max_age);
                if !expired {
                    break;
                }
                self.visible_start += 1;
            }
        }
        self.trim();
    }

    /// Drops entries nobody can read any more.
    fn trim(&mut self) {
        let keep_from = self
            .subscribers
            .iter()
            .map(|s| s.cursor.load(Ordering::Acquire))
            .fold(self.visible_start, u64::min);
        while self.entries.front().is_some_and(|e| e.index < keep_from) {
            self.entries.pop_front();
        }
    }
}

struct ReplaySubscription<T> {
    actual: Arc<dyn Subscriber<T>>,
    demand: Demand,
    cursor: AtomicU64,
    cancelled: AtomicBool,
    wip: AtomicU64,
    parent: Weak<ReplayInner<T>>,
}

enum Step<T> {
    Next(T),
    Terminal(Terminal),
    Idle,
}

impl<T: Clone + Send + 'static> Subscription for ReplaySubscription<T> {
    fn request(&self, n: u64) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                parent.remove(self);
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
            parent.remove(self);
        }
    }
}

impl<T: Clone + Send + 'static> ReplayInner<T> {
    fn drain(&self, subscriber: &ReplaySubscription<T>) {
        if subscriber.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            while !subscriber.cancelled.load(Ordering::Acquire) {
                match self.step(subscriber) {
                    Step::Next(value) => subscriber.actual.on_next(value),
                    Step::Terminal(terminal) => {
                        if !subscriber.cancelled.swap(true, Ordering::AcqRel) {
                            self.remove(subscriber);
                            terminal.deliver(&*subscriber.actual);
                        }
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

    fn step(&self, subscriber: &ReplaySubscription<T>) -> Step<T> {
        let mut state = self.state.lock();
        let cursor = subscriber
            .cursor
            .load(Ordering::Acquire)
            .max(state.front_index());

        if cursor < state.next_index {
            if !subscriber.demand.try_take() {
                return Step::Idle;
            }
            let value = state.entry(cursor).map(|e| e.value.clone());
            subscriber.cursor.store(cursor + 1, Ordering::Release);
            state.trim();
            return value.map_or(Step::Idle, Step::Next);
        }
        match &state.terminal {
            Some(terminal) => Step::Terminal(terminal.clone()),
            None => Step::Idle,
        }
    }

    fn remove(&self, subscriber: &ReplaySubscription<T>) {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), subscriber));
        state.trim();
    }

    fn drain_all(&self) {
        let subscribers = self.state.lock().subscribers.clone();
        for subscriber in subscribers {
            self.drain(&subscriber);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Replay<T> {
    /// Replays everything ever pushed.
    pub fn unbounded() -> Self {
        Self::build(Retention {
            history_size: None,
            max_age: None,
        })
    }

    pub fn with_size(config: ReplaySizeConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        Ok(Self::build(Retention {
            history_size: (!config.unbounded).then_some(config.history_size),
            max_age: None,
        }))
    }

    pub fn with_time(config: ReplayTimeConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        Ok(Self::build(Retention {
            history_size: config.history_size,
            max_age: Some((config.max_age, config.time_source)),
        }))
    }

    /// Replays only the latest value.
    pub fn cache_last() -> Self {
        Self::build(Retention {
            history_size: Some(1),
            max_age: None,
        })
    }

    /// Replays the latest value, or `default` while nothing was pushed.
    pub fn cache_last_or_default(default: T) -> Self {
        let replay = Self::cache_last();
        replay.inner.state.lock().append(default, Duration::ZERO);
        replay
    }

    fn build(retention: Retention) -> Self {
        Self {
            inner: Arc::new(ReplayInner {
                state: Mutex::new(ReplayState {
                    entries: VecDeque::new(),
                    next_index: 0,
                    visible_start: 0,
                    subscribers: Vec::new(),
                    terminal: None,
                }),
                retention,
                hooks: SinkHooks::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn terminate(&self, terminal: Terminal) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(terminal);
        }
        self.inner.drain_all();
        true
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for Replay<T> {
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        {
            let mut state = self.inner.state.lock();
            if state.terminal.is_some() {
                drop(state);
                hooks::next_dropped(value);
                return Err(ProcessorError::Terminated);
            }
            let now = self.inner.retention.now();
            state.append(value, now);
            state.expire(&self.inner.retention, now);
        }
        self.inner.drain_all();
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

impl<T: Clone + Send + Sync + 'static> Subscribable<T> for Replay<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let entry = Arc::new(ReplaySubscription {
            actual: subscriber.clone(),
            demand: Demand::default(),
            cursor: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            wip: AtomicU64::new(0),
            parent: Arc::downgrade(&self.inner),
        });

        {
            let mut state = self.inner.state.lock();
            let now = self.inner.retention.now();
            state.expire(&self.inner.retention, now);
            entry.cursor.store(state.visible_start, Ordering::Release);
            state.subscribers.push(entry.clone());
        }

        self.inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry.clone());
        self.inner.drain(&entry);
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Lifecycle for Replay<T> {
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

    /// Returns the history that would have been replayed to a new subscriber.
    fn force_dispose(&self) -> Vec<T> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let history = {
            let mut state = self.inner.state.lock();
            let visible_start = state.visible_start;
            let history = state
                .entries
                .drain(..)
                .filter(|e| e.index >= visible_start)
                .map(|e| e.value)
                .collect::<Vec<_>>();
            state.visible_start = state.next_index;
            if state.terminal.is_none() {
                state.terminal = Some(Terminal::Error(ProcessorError::Disposed));
            }
            history
        };
        tracing::debug!(history = history.len(), "replay cache disposed");
        self.inner.drain_all();
        self.inner.hooks.fire_cancel();
        self.inner.hooks.fire_dispose();
        history
    }

    fn available_capacity(&self) -> i64 {
        -1
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
    use crate::time::VirtualClock;

    async fn push_all(replay: &Replay<i32>, values: impl IntoIterator<Item = i32>) {
        for v in values {
            replay.next(v).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_size_bound_keeps_latest() {
        let replay = Replay::<i32>::with_size(ReplaySizeConfig::bounded(2)).unwrap();
        push_all(&replay, 1..=4).await;

        let sub = TestSubscriber::<i32>::unbounded();
        replay.subscribe(sub.clone());
        assert_eq!(sub.values(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_age_bound_evicts_on_push() {
        let clock = Arc::new(VirtualClock::new());
        let mut config = ReplayTimeConfig::new(Duration::from_millis(100));
        config.time_source = clock.clone();
        let replay = Replay::<i32>::with_time(config).unwrap();

        replay.next(1).await.unwrap();
        clock.set(Duration::from_millis(150));
        replay.next(2).await.unwrap();
        clock.set(Duration::from_millis(160));

        let sub = TestSubscriber::<i32>::unbounded();
        replay.subscribe(sub.clone());
        assert_eq!(sub.values(), vec![2]);
    }

    #[tokio::test]
    async fn test_age_bound_evicts_on_subscribe() {
        let clock = Arc::new(VirtualClock::new());
        let mut config = ReplayTimeConfig::new(Duration::from_millis(100));
        config.time_source = clock.clone();
        let replay = Replay::<i32>::with_time(config).unwrap();

        push_all(&replay, [1, 2]).await;
        clock.advance(Duration::from_millis(101));

        let sub = TestSubscriber::<i32>::unbounded();
        replay.subscribe(sub.clone());
        assert!(sub.values().is_empty());
    }

    #[tokio::test]
    async fn test_size_and_age_bounds_combine() {
        let clock = Arc::new(VirtualClock::new());
        let mut config = ReplayTimeConfig::new(Duration::from_millis(100));
        config.time_source = clock.clone();
        config.history_size = Some(2);
        let replay = Replay::<i32>::with_time(config).unwrap();

        push_all(&replay, [1, 2, 3]).await;
        clock.set(Duration::from_millis(50));
        replay.next(4).await.unwrap();

        let sub = TestSubscriber::<i32>::unbounded();
        replay.subscribe(sub.clone());
        assert_eq!(sub.values(), vec![3, 4]);

        clock.set(Duration::from_millis(120));
        let late = TestSubscriber::<i32>::unbounded();
        replay.subscribe(late.clone());
        assert_eq!(late.values(), vec![4]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_nothing() {
        let replay = Replay::<i32>::cache_last();
        let lagging = TestSubscriber::<i32>::new(0);
        replay.subscribe(lagging.clone());
        push_all(&replay, 1..=3).await;

        let fresh = TestSubscriber::<i32>::unbounded();
        replay.subscribe(fresh.clone());
        assert_eq!(fresh.values(), vec![3]);

        lagging.request(10);
        assert_eq!(lagging.values(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_replay_honours_demand_then_terminal() {
        let replay = Replay::<i32>::unbounded();
        push_all(&replay, 1..=3).await;
        replay.complete().await.unwrap();

        let sub = TestSubscriber::<i32>::new(2);
        replay.subscribe(sub.clone());
        assert_eq!(sub.values(), vec![1, 2]);
        assert!(sub.terminal().is_none());

        sub.request(1);
        assert_eq!(sub.values(), vec![1, 2, 3]);
        assert!(sub.is_completed());
    }

    #[tokio::test]
    async fn test_error_is_replayed_after_values() {
        let replay = Replay::<i32>::unbounded();
        replay.next(1).await.unwrap();
        replay.error(ProcessorError::Overflow).await.unwrap();

        for _ in 0..2 {
            let sub = TestSubscriber::<i32>::unbounded();
            replay.subscribe(sub.clone());
            assert_eq!(sub.values(), vec![1]);
            assert!(matches!(sub.error(), Some(ProcessorError::Overflow)));
        }
        assert!(matches!(
            replay.next(2).await,
            Err(ProcessorError::Terminated)
        ));
    }

    #[tokio::test]
    async fn test_cache_last_or_default() {
        let replay = Replay::cache_last_or_default(-1);
        let early = TestSubscriber::<i32>::unbounded();
        replay.subscribe(early.clone());
        assert_eq!(early.values(), vec![-1]);

        replay.next(5).await.unwrap();
        let late = TestSubscriber::<i32>::unbounded();
        replay.subscribe(late.clone());
        assert_eq!(late.values(), vec![5]);
        assert_eq!(early.values(), vec![-1, 5]);
    }

    #[tokio::test]
    async fn test_unbounded_size_config_keeps_everything() {
        let replay = Replay::<i32>::with_size(ReplaySizeConfig::unbounded()).unwrap();
        push_all(&replay, 0..1000).await;

        let sub = TestSubscriber::<i32>::unbounded();
        replay.subscribe(sub.clone());
        assert_eq!(sub.values().len(), 1000);
        assert_eq!(replay.available_capacity(), -1);
    }

    #[tokio::test]
    async fn test_force_dispose_returns_visible_history() {
        let replay = Replay::<i32>::with_size(ReplaySizeConfig::bounded(2)).unwrap();
        let sub = TestSubscriber::<i32>::new(0);
        replay.subscribe(sub.clone());
        push_all(&replay, 1..=3).await;

        assert_eq!(replay.force_dispose(), vec![2, 3]);
        assert!(replay.is_disposed());
        assert!(matches!(sub.error(), Some(ProcessorError::Disposed)));

        let late = TestSubscriber::<i32>::unbounded();
        replay.subscribe(late.clone());
        assert!(late.values().is_empty());
        assert!(matches!(late.error(), Some(ProcessorError::Disposed)));
    }

    #[tokio::test]
    async fn test_invalid_history_size() {
        assert!(matches!(
            Replay::<i32>::with_size(ReplaySizeConfig::bounded(0)),
            Err(ProcessorError::InvalidConfig(_))
        ));
    }
}
