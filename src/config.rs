//! # Processor configuration.
//!
//! Each engine takes an immutable config struct with public fields and a
//! documented [`Default`]. Constructors call `validate()` and refuse to build
//! an engine from an invalid config, before any task is spawned.
//!
//! # Example
//! ```
//! use fluxsink::{EmitterConfig, OverflowStrategy};
//!
//! let mut cfg = EmitterConfig::default();
//! cfg.buffer_size = 32;
//! cfg.overflow = OverflowStrategy::DropOldest;
//!
//! assert!(cfg.validate().is_ok());
//! ```

use crate::error::ProcessorError;
use crate::queue::Queue;
use crate::time::{MonotonicClock, TimeSource};
use crate::wait::WaitStrategy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Default buffer size of the emitter and ring-backed engines.
pub const DEFAULT_BUFFER_SIZE: usize = 256;
/// Default name of a ring-backed engine, used in its tracing span.
pub const DEFAULT_FAN_OUT_NAME: &str = "fanOut";
/// Default busy-spin iterations before [`WaitStrategy::PhasedBackoff`] yields.
pub const DEFAULT_SPIN_TRIES: u32 = 200;
/// Default yields before [`WaitStrategy::PhasedBackoff`] parks.
pub const DEFAULT_YIELD_TRIES: u32 = 100;

/// What a bounded engine does with a value it has no room for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Wait for room.
    Buffer,
    /// Discard the new value.
    Drop,
    /// Discard the oldest buffered value to make room.
    DropOldest,
    /// Fail the push with [`ProcessorError::Overflow`].
    Error,
    /// Keep the engine's native behaviour.
    #[default]
    Ignore,
}

/// Configuration of the single-subscriber queue engine.
pub struct UnicastConfig<T> {
    /// Backing queue. Its capacity decides when overflow applies.
    pub queue: Box<dyn Queue<T>>,
    /// Invoked once, on the first terminal signal or on disposal.
    pub end_callback: Option<Box<dyn FnOnce() + Send>>,
    pub overflow: OverflowStrategy,
    /// Receives values rejected by a full queue. Falls back to the
    /// dropped-value hook.
    pub on_overflow: Option<Box<dyn Fn(T) + Send + Sync>>,
}

impl<T> UnicastConfig<T> {
    pub fn new<Q>(queue: Q) -> Self
    where
        Q: Queue<T> + 'static,
    {
        Self {
            queue: Box::new(queue),
            end_callback: None,
            overflow: OverflowStrategy::default(),
            on_overflow: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.queue.capacity() == Some(0) {
            return Err(ProcessorError::InvalidConfig(
                "unicast queue capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl<T> fmt::Debug for UnicastConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnicastConfig")
            .field("capacity", &self.queue.capacity())
            .field("overflow", &self.overflow)
            .field("end_callback", &self.end_callback.is_some())
            .field("on_overflow", &self.on_overflow.is_some())
            .finish()
    }
}

/// Configuration of the emitter broadcaster.
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Values retained while no subscriber keeps up.
    pub buffer_size: usize,
    /// Shut the engine down once every subscriber has cancelled.
    pub auto_cancel: bool,
    pub overflow: OverflowStrategy,
}

impl Default for EmitterConfig {
    /// - `buffer_size = 256`
    /// - `auto_cancel = true`
    /// - `overflow = Ignore` (wait for room)
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            auto_cancel: true,
            overflow: OverflowStrategy::default(),
        }
    }
}

impl EmitterConfig {
    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.buffer_size == 0 {
            return Err(ProcessorError::InvalidConfig(
                "emitter buffer_size must be strictly positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a size-bounded replay cache.
#[derive(Debug, Clone)]
pub struct ReplaySizeConfig {
    /// Number of values replayed to new subscribers.
    pub history_size: usize,
    /// When `true`, `history_size` is only an initial capacity hint and
    /// nothing is evicted.
    pub unbounded: bool,
    /// Accepted for uniformity; a replay cache never rejects values.
    pub overflow: OverflowStrategy,
}

impl ReplaySizeConfig {
    pub fn bounded(history_size: usize) -> Self {
        Self {
            history_size,
            unbounded: false,
            overflow: OverflowStrategy::default(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            history_size: DEFAULT_BUFFER_SIZE,
            unbounded: true,
            overflow: OverflowStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.history_size == 0 {
            return Err(ProcessorError::InvalidConfig(
                "replay history_size must be strictly positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a time-bounded (optionally also size-bounded) replay cache.
#[derive(Debug, Clone)]
pub struct ReplayTimeConfig {
    /// Values older than this are no longer replayed.
    pub max_age: Duration,
    /// Additional size bound.
    pub history_size: Option<usize>,
    pub time_source: Arc<dyn TimeSource>,
    /// Accepted for uniformity; a replay cache never rejects values.
    pub overflow: OverflowStrategy,
}

impl ReplayTimeConfig {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            history_size: None,
            time_source: Arc::new(MonotonicClock::new()),
            overflow: OverflowStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.history_size == Some(0) {
            return Err(ProcessorError::InvalidConfig(
                "replay history_size must be strictly positive".into(),
            ));
        }
        Ok(())
    }
}

/// How a ring-backed engine routes values to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Every subscriber sees every value.
    #[default]
    Broadcast,
    /// Each value goes to exactly one subscriber, in round-robin order.
    RoundRobin,
}

/// Where ring-backed engines run their workers, and how many.
#[derive(Debug, Clone)]
pub struct Executor {
    pub handle: Handle,
    /// Upper bound on concurrent subscribers.
    pub max_workers: usize,
}

impl Executor {
    pub fn new(handle: Handle, max_workers: usize) -> Self {
        Self {
            handle,
            max_workers,
        }
    }

    /// The current runtime, with no practical worker limit.
    pub fn current() -> Result<Self, ProcessorError> {
        let handle = Handle::try_current()
            .map_err(|e| ProcessorError::InvalidConfig(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(handle, Semaphore::MAX_PERMITS))
    }
}

/// Configuration of the ring-buffer fan-out engines.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Name used in tracing spans.
    pub name: String,
    /// Ring capacity; must be a power of two.
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
    /// Shut the engine down once every subscriber has cancelled.
    pub auto_cancel: bool,
    /// Worker executor. Defaults to the current runtime.
    pub executor: Option<Executor>,
    /// Runtime for `on_request` callbacks. Defaults to the worker executor.
    pub request_task_executor: Option<Handle>,
    /// Allow concurrent producers.
    pub share: bool,
    pub dispatch: DispatchPolicy,
    /// Applies to values only. Terminal signals always wait for room.
    pub overflow: OverflowStrategy,
}

impl Default for FanOutConfig {
    /// - `name = "fanOut"`
    /// - `buffer_size = 256`
    /// - `wait_strategy = PhasedBackoff { 200, 100 }`
    /// - `auto_cancel = true`
    /// - `share = false`
    /// - `dispatch = Broadcast`
    /// - `overflow = Ignore` (wait for room)
    fn default() -> Self {
        Self {
            name: DEFAULT_FAN_OUT_NAME.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            wait_strategy: WaitStrategy::default(),
            auto_cancel: true,
            executor: None,
            request_task_executor: None,
            share: false,
            dispatch: DispatchPolicy::default(),
            overflow: OverflowStrategy::default(),
        }
    }
}

impl FanOutConfig {
    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.buffer_size < 2 || !self.buffer_size.is_power_of_two() {
            return Err(ProcessorError::InvalidConfig(format!(
                "buffer_size must be a power of two >= 2, got {}",
                self.buffer_size
            )));
        }
        if self.name.is_empty() {
            return Err(ProcessorError::InvalidConfig("name must not be empty".into()));
        }
        if self.executor.as_ref().is_some_and(|e| e.max_workers == 0) {
            return Err(ProcessorError::InvalidConfig(
                "executor max_workers must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the first-value engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstConfig {
    /// Used by `block` and `block_timeout`.
    pub wait_strategy: WaitStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BoundedQueue, UnboundedQueue};

    #[test]
    fn test_fan_out_defaults() {
        let cfg = FanOutConfig::default();
        assert_eq!(cfg.name, "fanOut");
        assert_eq!(cfg.buffer_size, 256);
        assert!(cfg.auto_cancel);
        assert!(!cfg.share);
        assert_eq!(
            cfg.wait_strategy,
            WaitStrategy::PhasedBackoff {
                spin_tries: 200,
                yield_tries: 100
            }
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_fan_out_rejects_non_power_of_two() {
        for size in [0, 1, 3, 100] {
            let cfg = FanOutConfig {
                buffer_size: size,
                ..Default::default()
            };
            assert!(matches!(
                cfg.validate(),
                Err(ProcessorError::InvalidConfig(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_fan_out_rejects_zero_workers() {
        let cfg = FanOutConfig {
            executor: Some(Executor::new(Handle::current(), 0)),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_emitter_rejects_zero_buffer() {
        let cfg = EmitterConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unicast_rejects_zero_capacity_queue() {
        assert!(UnicastConfig::<u8>::new(BoundedQueue::new(0)).validate().is_err());
        assert!(UnicastConfig::<u8>::new(UnboundedQueue::new()).validate().is_ok());
    }

    #[test]
    fn test_replay_rejects_empty_history() {
        assert!(ReplaySizeConfig::bounded(0).validate().is_err());
        let mut cfg = ReplayTimeConfig::new(Duration::from_secs(1));
        cfg.history_size = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_executor_requires_runtime() {
        assert!(Executor::current().is_err());
    }
}
