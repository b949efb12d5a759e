//! Backpressure-aware signal processors.
//!
//! A processor is a bridge: producers push values and one terminal signal
//! into it through [`Sink`], subscribers pull them out through
//! [`Subscribable`] by requesting demand, and [`Lifecycle`] reports whether
//! it is still running.
//!
//! | engine      | subscribers | buffering                                    |
//! |-------------|-------------|----------------------------------------------|
//! | [`Direct`]  | many        | none; a subscriber without demand is dropped |
//! | [`Unicast`] | one         | a [`Queue`] of any capacity                  |
//! | [`Emitter`] | many        | bounded warm-up window                       |
//! | [`Replay`]  | many        | history by count and/or age                  |
//! | [`FanOut`]  | many        | ring buffer, served by worker tasks          |
//! | [`First`]   | many        | the first value only                         |
//!
//! ```
//! use fluxsink::{Emitter, Lifecycle, Sink};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let emitter = Emitter::<u32>::new();
//! emitter.next(1).await.unwrap();
//! emitter.complete().await.unwrap();
//! assert!(emitter.is_terminated());
//! # }
//! ```

mod bus;
mod config;
mod context;
mod cursor;
mod demand;
mod error;
mod fence;
pub mod hooks;
mod lifecycle;
mod processor;
mod queue;
mod ring_buffer;
mod signal;
mod sink;
mod subscriber;
mod time;
mod wait;

#[cfg(test)]
mod test_support;

pub use crate::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_FAN_OUT_NAME, DEFAULT_SPIN_TRIES, DEFAULT_YIELD_TRIES,
    DispatchPolicy, EmitterConfig, Executor, FanOutConfig, FirstConfig, OverflowStrategy,
    ReplaySizeConfig, ReplayTimeConfig, UnicastConfig,
};
pub use crate::context::Context;
pub use crate::demand::UNBOUNDED;
pub use crate::error::ProcessorError;
pub use crate::lifecycle::Lifecycle;
pub use crate::processor::{Direct, Emitter, FanOut, First, Replay, Unicast};
pub use crate::queue::{BoundedQueue, Queue, UnboundedQueue};
pub use crate::signal::{Signal, Terminal};
pub use crate::sink::{RequestCallback, Sink, TeardownCallback};
pub use crate::subscriber::{Subscribable, Subscriber, Subscription};
pub use crate::time::{MonotonicClock, TimeSource, VirtualClock};
pub use crate::wait::WaitStrategy;

/// A full processor: push side, pull side and lifecycle in one handle.
pub trait Processor<T: Send + 'static>:
    Sink<T> + Subscribable<T> + Lifecycle<Item = T>
{
}

impl<T, P> Processor<T> for P
where
    T: Send + 'static,
    P: Sink<T> + Subscribable<T> + Lifecycle<Item = T>,
{
}
