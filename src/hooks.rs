//! Process-wide handlers for signals that have nowhere to go.
//!
//! A value pushed into a terminated processor, or an error pushed after a
//! terminal signal or after every subscriber cancelled, is routed here.
//! Handlers are replaceable at runtime and can be reset to the defaults:
//!
//! - dropped values are logged at `debug` level;
//! - dropped errors are logged at `error` level and then re-raised as a panic,
//!   since silently losing an error hides bugs.

use crate::error::ProcessorError;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::{Arc, LazyLock};

type ErrorHook = Arc<dyn Fn(&ProcessorError) + Send + Sync>;
type NextHook = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

static ERROR_DROPPED: LazyLock<RwLock<Option<ErrorHook>>> = LazyLock::new(Default::default);
static NEXT_DROPPED: LazyLock<RwLock<Option<NextHook>>> = LazyLock::new(Default::default);

/// Replaces the handler for errors that no subscriber will ever receive.
pub fn on_error_dropped<F>(hook: F)
where
    F: Fn(&ProcessorError) + Send + Sync + 'static,
{
    *ERROR_DROPPED.write() = Some(Arc::new(hook));
}

/// Replaces the handler for values that cannot be delivered or buffered.
///
/// The value is passed type-erased; downcast it to the processor's item type.
pub fn on_next_dropped<F>(hook: F)
where
    F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
{
    *NEXT_DROPPED.write() = Some(Arc::new(hook));
}

/// Restores the default dropped-error handler.
pub fn reset_on_error_dropped() {
    *ERROR_DROPPED.write() = None;
}

/// Restores the default dropped-value handler.
pub fn reset_on_next_dropped() {
    *NEXT_DROPPED.write() = None;
}

pub(crate) fn error_dropped(error: &ProcessorError) {
    // Clone the handler out so it runs without the lock held.
    let hook = ERROR_DROPPED.read().clone();
    match hook {
        Some(hook) => hook(error),
        None => {
            tracing::error!(
                error = %error,
                label = error.as_label(),
                "error dropped without a receiver"
            );
            panic!("error dropped without a receiver: {error}");
        }
    }
}

pub(crate) fn next_dropped<T: Send + 'static>(value: T) {
    let hook = NEXT_DROPPED.read().clone();
    match hook {
        Some(hook) => hook(Box::new(value)),
        None => tracing::debug!(
            item = std::any::type_name::<T>(),
            "value dropped: no receiver"
        ),
    }
}
