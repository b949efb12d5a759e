//! The processor engines.
//!
//! Every engine is both a [`Sink`](crate::Sink) and a
//! [`Subscribable`](crate::Subscribable), and reports its state through
//! [`Lifecycle`](crate::Lifecycle). Handles are cheap to clone and share
//! one engine.

mod direct;
mod emitter;
mod fan_out;
mod first;
mod replay;
mod topic;
mod unicast;
mod work_queue;

pub use direct::Direct;
pub use emitter::Emitter;
pub use fan_out::FanOut;
pub use first::First;
pub use replay::Replay;
pub use unicast::Unicast;
