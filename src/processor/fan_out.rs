//! Ring-buffer engines that fan one producer stream out to many subscribers.
//!
//! Values are published into a [`RingBus`] and consumed by tasks spawned on
//! the configured executor. Two routing policies share the producer side:
//!
//! - [`DispatchPolicy::Broadcast`] (a topic): one worker task per subscriber,
//!   each with its own ring cursor, so every subscriber sees every value in
//!   publication order. The producer is held back by the slowest cursor.
//! - [`DispatchPolicy::RoundRobin`] (a work queue): one dispatcher task owns
//!   the only cursor and hands each value to exactly one subscriber with
//!   outstanding demand.
//!
//! While a topic has no subscribers a gate cursor keeps published values in
//! the ring, so the first subscriber receives what was pushed before it
//! arrived. A subscriber joining while others are active starts at the
//! current publication point.

use crate::bus::{Claim, RingBus};
use crate::config::{DispatchPolicy, Executor, FanOutConfig, OverflowStrategy};
use crate::context::Context;
use crate::cursor::Cursor;
use crate::demand::Demand;
use crate::error::ProcessorError;
use crate::hooks;
use crate::lifecycle::Lifecycle;
use crate::processor::{topic, work_queue};
use crate::signal::{Signal, Terminal};
use crate::sink::{RequestCallback, Sink, SinkHooks, TeardownCallback};
use crate::subscriber::{
    NoopSubscription, Subscribable, Subscriber, Subscription, complete_empty, reject,
};
use crate::wait::WaitStrategy;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// A ring-backed multicast or work-distribution processor.
///
/// Cloning yields another handle on the same processor. Dropping the last
/// handle before a terminal was pushed disposes the processor, so workers
/// never wait for a producer that is gone.
pub struct FanOut<T> {
    inner: Arc<FanOutInner<T>>,
    _owner: Arc<Owner<T>>,
}

impl<T> Clone for FanOut<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _owner: Arc::clone(&self._owner),
        }
    }
}

/// Shared by every handle; its drop means no producer is left.
struct Owner<T>(Arc<FanOutInner<T>>);

impl<T> Drop for Owner<T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

pub(super) struct FanOutInner<T> {
    name: String,
    pub(super) bus: RingBus<T>,
    pub(super) wait: WaitStrategy,
    auto_cancel: bool,
    share: bool,
    dispatch: DispatchPolicy,
    overflow: OverflowStrategy,
    handle: Handle,
    request_handle: Handle,
    workers: Arc<Semaphore>,
    max_workers: usize,
    tracker: TaskTracker,
    pub(super) shutdown: CancellationToken,
    pub(super) state: Mutex<FanOutState<T>>,
    hooks: SinkHooks,
    pub(super) disposed: AtomicBool,
    /// Held shared by a topic worker between its disposal check and its
    /// cursor advance, and exclusively by disposal.
    pub(super) delivery: RwLock<()>,
    /// Slowest cursor last reported to the `on_request` callback.
    requested_mark: Cursor,
    /// Set while a progress report is queued on the request executor.
    progress_pending: AtomicBool,
    /// Woken when a work-queue subscriber arrives or requests more.
    pub(super) ready: Notify,
    /// Cursor of the work-queue dispatcher.
    pub(super) dispatcher: Option<u64>,
}

pub(super) struct FanOutState<T> {
    pub(super) terminal: Option<Terminal>,
    /// Ring sequence holding the terminal, once published.
    pub(super) terminal_seq: Option<i64>,
    /// Topic cursor retaining values while nobody is subscribed.
    gate: Option<u64>,
    pub(super) subscribers: Vec<Arc<FanOutSubscription<T>>>,
    /// Set by auto-cancel once the last subscriber left.
    cancelled: bool,
    dispatcher_started: bool,
    next_serial: u64,
}

pub(super) struct FanOutSubscription<T> {
    pub(super) actual: Arc<dyn Subscriber<T>>,
    pub(super) demand: Demand,
    /// Child of the processor's shutdown token.
    pub(super) token: CancellationToken,
    /// Woken on new demand.
    pub(super) notify: Notify,
    pub(super) cancelled: AtomicBool,
    /// Set once a terminal has been handed to `actual`.
    pub(super) finished: AtomicBool,
    /// Arrival order, used by round-robin routing.
    pub(super) serial: u64,
    /// Topic cursor; `None` for work-queue subscribers.
    pub(super) consumer: Option<u64>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    parent: Weak<FanOutInner<T>>,
}

impl<T: 'static> FanOutSubscription<T> {
    /// Delivers `terminal` unless one was already delivered.
    pub(super) fn finish(&self, terminal: &Terminal) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            terminal.deliver(&*self.actual);
        }
    }

    pub(super) fn release(&self) {
        self.permit.lock().take();
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription for FanOutSubscription<T> {
    fn request(&self, n: u64) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.finish(&Terminal::Error(ProcessorError::InvalidRequest));
                parent.detach(self);
            }
            return;
        }
        self.demand.add(n);
        self.notify.notify_waiters();
        parent.ready.notify_waiters();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.detach(self);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FanOutInner<T> {
    /// Why a push is refused, if it is.
    fn rejection(&self) -> Option<ProcessorError> {
        let state = self.state.lock();
        if state.cancelled {
            Some(ProcessorError::Cancelled)
        } else if state.terminal.is_some() {
            Some(ProcessorError::Terminated)
        } else {
            None
        }
    }

    async fn claim(&self) -> Result<Claim<'_>, ProcessorError> {
        if self.share {
            Ok(self.bus.claim().await)
        } else {
            self.bus.try_claim().ok_or(ProcessorError::ConcurrentProducer)
        }
    }

    /// Stops a subscriber on its own request.
    fn detach(&self, subscriber: &FanOutSubscription<T>) {
        match subscriber.consumer {
            // The topic worker notices and leaves on its way out.
            Some(_) => subscriber.token.cancel(),
            None => self.leave(subscriber),
        }
    }

    /// Removes a subscriber that is gone for good.
    pub(super) fn leave(&self, subscriber: &FanOutSubscription<T>) {
        subscriber.release();
        let auto_cancelled = {
            let mut state = self.state.lock();
            state
                .subscribers
                .retain(|s| !std::ptr::eq(Arc::as_ptr(s), subscriber));

            if state.subscribers.is_empty() && state.gate.is_none() {
                if let Some(consumer) = subscriber.consumer {
                    let position = self
                        .bus
                        .position(consumer)
                        .unwrap_or_else(|| self.bus.published());
                    state.gate = Some(self.bus.register(position));
                }
            }

            let trigger = self.auto_cancel
                && state.subscribers.is_empty()
                && state.terminal.is_none()
                && !state.cancelled;
            if trigger {
                state.cancelled = true;
            }
            trigger
        };

        if let Some(consumer) = subscriber.consumer {
            self.bus.deregister(consumer);
        }
        if auto_cancelled {
            tracing::debug!(name = %self.name, "fan-out auto-cancelled: last subscriber left");
            self.shutdown.cancel();
            self.hooks.fire_cancel();
        }
    }

    /// Tells the `on_request` callback how many slots the consumers freed.
    ///
    /// At most one report is queued at a time; it covers every advance made
    /// before it runs.
    pub(super) fn report_progress(self: &Arc<Self>) {
        if self.hooks.request_callback().is_none()
            || self.progress_pending.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let inner = Arc::clone(self);
        self.tracker.spawn_on(
            async move {
                inner.progress_pending.store(false, Ordering::Release);
                let (Some(callback), Some(min)) =
                    (inner.hooks.request_callback(), inner.bus.min_gating())
                else {
                    return;
                };
                let previous = inner.requested_mark.fetch_max(min);
                if min > previous {
                    callback((min - previous) as u64);
                }
            },
            &self.request_handle,
        );
    }

    fn overflowed(&self, value: T) {
        tracing::debug!(name = %self.name, strategy = ?self.overflow, "fan-out ring full");
        hooks::next_dropped(value);
    }

    /// Next work-queue subscriber with demand, in arrival order after `last`.
    pub(super) fn pick_ready(&self, last: Option<u64>) -> Option<Arc<FanOutSubscription<T>>> {
        let state = self.state.lock();
        let mut ready = state.subscribers.iter().filter(|s| {
            !s.cancelled.load(Ordering::Acquire) && s.demand.get() > 0
        });
        let first = ready.clone().next();
        let after = match last {
            Some(last) => ready.find(|s| s.serial > last),
            None => None,
        };
        after.or(first).cloned()
    }
}

impl<T> FanOutInner<T> {
    /// Marks the processor disposed and returns the slowest cursor at that
    /// moment. No topic worker advances past it afterwards.
    fn begin_disposal(&self) -> Option<i64> {
        let _exclusive = self.delivery.write();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let from = self.bus.min_gating().unwrap_or_else(|| self.bus.published());
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Error(ProcessorError::Disposed));
        }
        Some(from)
    }

    /// Stops workers and runs the teardown callbacks.
    fn halt(&self) {
        self.shutdown.cancel();
        self.bus.producer_notify.notify_waiters();
        self.bus.consumer_notify.notify_waiters();
        self.ready.notify_waiters();
        self.hooks.fire_cancel();
        self.hooks.fire_dispose();
    }

    /// Called when the last handle drops. A processor that already has a
    /// terminal keeps running until its workers deliver it.
    fn abandon(&self) {
        if self.state.lock().terminal.is_some() {
            return;
        }
        if self.begin_disposal().is_some() {
            tracing::debug!(name = %self.name, "fan-out dropped without a terminal");
            self.halt();
        }
    }
}

impl<T: Clone + Send + Sync + 'static> FanOut<T> {
    /// Builds the engine `config.dispatch` names.
    ///
    /// Fails with [`ProcessorError::InvalidConfig`] on an invalid config, or
    /// when no executor is configured and no runtime is running.
    pub fn new(config: FanOutConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        let executor = match config.executor {
            Some(executor) => executor,
            None => Executor::current()?,
        };
        let request_handle = config
            .request_task_executor
            .unwrap_or_else(|| executor.handle.clone());

        let bus = RingBus::new(config.buffer_size);
        let anchor = bus.register(-1);
        let (gate, dispatcher) = match config.dispatch {
            DispatchPolicy::Broadcast => (Some(anchor), None),
            DispatchPolicy::RoundRobin => (None, Some(anchor)),
        };

        tracing::debug!(
            name = %config.name,
            buffer_size = config.buffer_size,
            dispatch = ?config.dispatch,
            share = config.share,
            "fan-out created"
        );

        let inner = Arc::new(FanOutInner {
            name: config.name,
            bus,
            wait: config.wait_strategy,
            auto_cancel: config.auto_cancel,
            share: config.share,
            dispatch: config.dispatch,
            overflow: config.overflow,
            handle: executor.handle,
            request_handle,
            workers: Arc::new(Semaphore::new(executor.max_workers)),
            max_workers: executor.max_workers,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            state: Mutex::new(FanOutState {
                terminal: None,
                terminal_seq: None,
                gate,
                subscribers: Vec::new(),
                cancelled: false,
                dispatcher_started: false,
                next_serial: 0,
            }),
            hooks: SinkHooks::default(),
            disposed: AtomicBool::new(false),
            delivery: RwLock::new(()),
            requested_mark: Cursor::default(),
            progress_pending: AtomicBool::new(false),
            ready: Notify::new(),
            dispatcher,
        });
        Ok(Self {
            _owner: Arc::new(Owner(Arc::clone(&inner))),
            inner,
        })
    }

    /// A broadcasting engine: every subscriber sees every value.
    pub fn topic(config: FanOutConfig) -> Result<Self, ProcessorError> {
        Self::new(FanOutConfig {
            dispatch: DispatchPolicy::Broadcast,
            ..config
        })
    }

    /// A work-distributing engine: each value reaches one subscriber.
    pub fn work_queue(config: FanOutConfig) -> Result<Self, ProcessorError> {
        Self::new(FanOutConfig {
            dispatch: DispatchPolicy::RoundRobin,
            ..config
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Records `terminal` and publishes it behind the buffered values.
    ///
    /// Refused once a terminal exists or after an auto-cancel.
    async fn terminate(&self, terminal: Terminal) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if state.terminal.is_some() {
                return Err(ProcessorError::Terminated);
            }
            if state.cancelled {
                return Err(ProcessorError::Cancelled);
            }
            state.terminal = Some(terminal.clone());
        }

        // Terminals queue behind in-flight pushes even without `share`.
        let claim = inner.bus.claim().await;
        let sequence = claim.sequence();
        let room = inner
            .wait
            .wait_until(&inner.bus.producer_notify, &inner.shutdown, || {
                inner.bus.has_capacity(sequence)
            })
            .await;
        if room.is_err() {
            // Disposed meanwhile; workers report the disposal themselves.
            return Ok(());
        }

        let mut state = inner.state.lock();
        inner.bus.publish(claim, terminal.into());
        state.terminal_seq = Some(sequence);
        Ok(())
    }

    fn spawn_topic_worker(&self, subscriber: Arc<FanOutSubscription<T>>, start: i64) {
        let inner = &self.inner;
        let span = tracing::info_span!("fan_out", name = %inner.name, serial = subscriber.serial);
        inner.tracker.spawn_on(
            topic::run(Arc::clone(inner), subscriber, start).instrument(span),
            &inner.handle,
        );
    }

    fn spawn_dispatcher(&self, consumer: u64) {
        let inner = &self.inner;
        let span = tracing::info_span!("fan_out", name = %inner.name);
        inner.tracker.spawn_on(
            work_queue::run(Arc::clone(inner), consumer).instrument(span),
            &inner.handle,
        );
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Sink<T> for FanOut<T> {
    async fn next(&self, value: T) -> Result<(), ProcessorError> {
        let inner = &self.inner;
        if let Some(error) = inner.rejection() {
            hooks::next_dropped(value);
            return Err(error);
        }
        let claim = match inner.claim().await {
            Ok(claim) => claim,
            Err(error) => {
                tracing::warn!(name = %inner.name, "concurrent push into a non-shared fan-out");
                hooks::next_dropped(value);
                return Err(error);
            }
        };
        if let Some(error) = inner.rejection() {
            drop(claim);
            hooks::next_dropped(value);
            return Err(error);
        }

        let sequence = claim.sequence();
        if !inner.bus.has_capacity(sequence) {
            match inner.overflow {
                // The ring cannot evict a slot a cursor still points at.
                OverflowStrategy::Drop | OverflowStrategy::DropOldest => {
                    drop(claim);
                    inner.overflowed(value);
                    return Ok(());
                }
                OverflowStrategy::Error => {
                    drop(claim);
                    inner.overflowed(value);
                    return Err(ProcessorError::Overflow);
                }
                OverflowStrategy::Buffer | OverflowStrategy::Ignore => {
                    let room = inner
                        .wait
                        .wait_until(&inner.bus.producer_notify, &inner.shutdown, || {
                            inner.bus.has_capacity(sequence)
                        })
                        .await;
                    if room.is_err() {
                        drop(claim);
                        hooks::next_dropped(value);
                        return Err(inner.rejection().unwrap_or(ProcessorError::Cancelled));
                    }
                }
            }
        }

        inner.bus.publish(claim, Signal::Next(value));
        Ok(())
    }

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError> {
        self.terminate(Terminal::Error(error.clone()))
            .await
            .inspect_err(|_| hooks::error_dropped(&error))
    }

    async fn complete(&self) -> Result<(), ProcessorError> {
        let _ = self.terminate(Terminal::Complete).await;
        Ok(())
    }

    fn on_request(&self, callback: RequestCallback) {
        if let Some(min) = self.inner.bus.min_gating() {
            self.inner.requested_mark.fetch_max(min);
        }
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

    /// Free ring slots: how many values may be pushed without waiting.
    fn requested_from_downstream(&self) -> u64 {
        self.inner.bus.remaining_capacity().max(0) as u64
    }
}

impl<T: Clone + Send + Sync + 'static> Subscribable<T> for FanOut<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let inner = &self.inner;
        let Ok(permit) = Arc::clone(&inner.workers).try_acquire_owned() else {
            tracing::warn!(
                name = %inner.name,
                max_workers = inner.max_workers,
                "fan-out worker limit reached"
            );
            reject(&*subscriber, ProcessorError::ExecutorSaturated(inner.max_workers));
            return;
        };

        let mut state = inner.state.lock();
        if inner.disposed.load(Ordering::Acquire) {
            let terminal = state
                .terminal
                .clone()
                .unwrap_or(Terminal::Error(ProcessorError::Disposed));
            drop(state);
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            terminal.deliver(&*subscriber);
            return;
        }
        if state.cancelled {
            drop(state);
            complete_empty(&*subscriber);
            return;
        }

        let published = inner.bus.published();
        let start = match (inner.dispatcher, state.gate) {
            (Some(dispatcher), _) | (None, Some(dispatcher)) => {
                inner.bus.position(dispatcher).unwrap_or(published)
            }
            (None, None) => published,
        };
        if let Some(terminal_seq) = state.terminal_seq {
            if start >= terminal_seq {
                let terminal = state.terminal.clone().unwrap_or(Terminal::Complete);
                drop(state);
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                terminal.deliver(&*subscriber);
                return;
            }
        }

        let consumer = match inner.dispatch {
            DispatchPolicy::Broadcast => {
                let id = inner.bus.register(start);
                if let Some(gate) = state.gate.take() {
                    inner.bus.deregister(gate);
                }
                Some(id)
            }
            DispatchPolicy::RoundRobin => None,
        };
        let serial = state.next_serial;
        state.next_serial += 1;

        let entry = Arc::new(FanOutSubscription {
            actual: Arc::clone(&subscriber),
            demand: Demand::default(),
            token: inner.shutdown.child_token(),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            serial,
            consumer,
            permit: Mutex::new(Some(permit)),
            parent: Arc::downgrade(inner),
        });
        state.subscribers.push(Arc::clone(&entry));
        let start_dispatcher = inner.dispatch == DispatchPolicy::RoundRobin
            && !std::mem::replace(&mut state.dispatcher_started, true);
        drop(state);

        inner.hooks.adopt_context(subscriber.context());
        subscriber.on_subscribe(entry.clone());

        match (consumer, inner.dispatcher) {
            (Some(_), _) => self.spawn_topic_worker(entry, start),
            (None, Some(dispatcher)) => {
                if start_dispatcher {
                    self.spawn_dispatcher(dispatcher);
                }
                inner.ready.notify_waiters();
            }
            (None, None) => {}
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Lifecycle for FanOut<T> {
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

    /// Stops every worker and returns the values the slowest subscriber has
    /// not consumed yet.
    fn force_dispose(&self) -> Vec<T> {
        let inner = &self.inner;
        let Some(from) = inner.begin_disposal() else {
            return Vec::new();
        };

        let undelivered: Vec<T> = (from + 1..=inner.bus.published())
            .filter_map(|sequence| match inner.bus.buffer.take(sequence) {
                Some(Signal::Next(value)) => Some(value),
                _ => None,
            })
            .collect();

        tracing::debug!(name = %inner.name, undelivered = undelivered.len(), "fan-out disposed");
        inner.halt();
        undelivered
    }

    /// Completes the processor, then waits for the workers to drain the ring.
    /// Whatever is still running after `timeout` is stopped.
    async fn dispose_and_await(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let graceful = async {
            if !self.is_terminated() {
                let _ = self.complete().await;
            }
            inner.tracker.close();
            inner.tracker.wait().await;
        };
        let finished = tokio::time::timeout(timeout, graceful).await.is_ok();
        if !finished {
            tracing::warn!(
                name = %inner.name,
                ?timeout,
                "fan-out did not drain in time, forcing disposal"
            );
        }
        self.force_dispose();
        finished
    }

    fn available_capacity(&self) -> i64 {
        self.inner.bus.remaining_capacity()
    }

    fn downstream_count(&self) -> i64 {
        self.inner.state.lock().subscribers.len() as i64
    }

    fn is_serialized(&self) -> bool {
        self.inner.share
    }
}
