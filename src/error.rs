//! Error type shared by every processor engine.
//!
//! [`ProcessorError`] covers configuration mistakes, demand-protocol
//! violations, capacity violations and runtime failures. It is `Clone`
//! because a recorded terminal error is replayed to every current and
//! future subscriber.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// # Errors produced by processors and delivered to subscribers.
///
/// User-supplied failures enter through [`ProcessorError::upstream`] and are
/// carried verbatim to subscribers.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ProcessorError {
    /// A configuration value was rejected by the constructor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A value arrived for a subscriber that had no outstanding demand.
    #[error("subscriber has no outstanding demand")]
    IllegalDemand,

    /// `request(0)` was issued.
    #[error("request amount must be positive")]
    InvalidRequest,

    /// A bounded buffer rejected a value.
    #[error("buffer overflow")]
    Overflow,

    /// A second live subscriber tried to attach to a single-subscriber engine.
    #[error("processor allows only a single subscriber")]
    MultipleSubscribers,

    /// A signal was pushed after the processor reached a terminal state.
    #[error("processor already terminated")]
    Terminated,

    /// The processor cancelled itself because every subscriber went away.
    #[error("processor cancelled")]
    Cancelled,

    /// The processor was disposed.
    #[error("processor disposed")]
    Disposed,

    /// The executor refused another worker.
    #[error("executor saturated: at most {0} workers")]
    ExecutorSaturated(usize),

    /// Two producers raced on a processor configured for a single producer.
    #[error("concurrent producer on a non-shared processor")]
    ConcurrentProducer,

    /// A blocking accessor gave up.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An error supplied by the producer.
    #[error("{0}")]
    Upstream(Arc<dyn std::error::Error + Send + Sync>),
}

impl ProcessorError {
    /// Wraps a producer-side error so it can be pushed through a sink.
    pub fn upstream<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProcessorError::Upstream(Arc::new(error))
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ProcessorError::InvalidConfig(_) => "invalid_config",
            ProcessorError::IllegalDemand => "illegal_demand",
            ProcessorError::InvalidRequest => "invalid_request",
            ProcessorError::Overflow => "overflow",
            ProcessorError::MultipleSubscribers => "multiple_subscribers",
            ProcessorError::Terminated => "terminated",
            ProcessorError::Cancelled => "cancelled",
            ProcessorError::Disposed => "disposed",
            ProcessorError::ExecutorSaturated(_) => "executor_saturated",
            ProcessorError::ConcurrentProducer => "concurrent_producer",
            ProcessorError::Timeout(_) => "timeout",
            ProcessorError::Upstream(_) => "upstream",
        }
    }
}
