//! Termination and disposal state of a processor.

use crate::error::ProcessorError;
use async_trait::async_trait;
use std::time::Duration;

/// # Lifecycle and capacity introspection.
///
/// A processor moves from active to terminated exactly once. Disposal is
/// orthogonal: it forces the processor down, records
/// [`ProcessorError::Disposed`] as the terminal when none was recorded, and
/// refuses further subscriptions.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    type Item: Send;

    fn is_complete(&self) -> bool;

    fn is_error(&self) -> bool;

    fn is_terminated(&self) -> bool {
        self.is_complete() || self.is_error()
    }

    /// The recorded terminal error, if any.
    fn terminal_error(&self) -> Option<ProcessorError>;

    /// Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;

    /// Disposes and returns the values that were never delivered.
    ///
    /// The default only disposes; engines that buffer override it.
    fn force_dispose(&self) -> Vec<Self::Item> {
        self.dispose();
        Vec::new()
    }

    /// Shuts down gracefully and waits up to `timeout` for in-flight work.
    /// Returns `true` if everything finished in time.
    async fn dispose_and_await(&self, timeout: Duration) -> bool {
        let _ = timeout;
        self.dispose();
        self.is_disposed()
    }

    /// Room left for new values; `-1` when unbounded or untracked.
    fn available_capacity(&self) -> i64;

    /// Number of active subscribers; `-1` when untracked.
    fn downstream_count(&self) -> i64;

    fn has_downstreams(&self) -> bool {
        self.downstream_count() != 0
    }

    /// `true` when concurrent pushes are safe.
    fn is_serialized(&self) -> bool;
}
