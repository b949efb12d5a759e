//! The producer-facing side of a processor.
//!
//! A [`Sink`] accepts values and one terminal signal, and lets the producer
//! observe what happens downstream: demand (`on_request`), cancellation
//! (`on_cancel`) and disposal (`on_dispose`).

use crate::context::Context;
use crate::error::ProcessorError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callback receiving each amount of new downstream demand.
pub type RequestCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Callback run once when the downstream goes away.
pub type TeardownCallback = Box<dyn FnOnce() + Send>;

/// # Push API of a processor.
///
/// Pushes are `async` because bounded engines make the producer wait for
/// room. After a terminal signal every further value is handed to the
/// dropped-value hook and the push fails with [`ProcessorError::Terminated`]
/// (or [`ProcessorError::Cancelled`] after an auto-cancel). A second
/// `complete` is a no-op; a second `error` goes to the dropped-error hook.
#[async_trait]
pub trait Sink<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn next(&self, value: T) -> Result<(), ProcessorError>;

    async fn error(&self, error: ProcessorError) -> Result<(), ProcessorError>;

    async fn complete(&self) -> Result<(), ProcessorError>;

    /// Registers a demand callback. It is invoked right away with the demand
    /// already outstanding, if any, then with each new request.
    fn on_request(&self, callback: RequestCallback);

    /// Runs `callback` once when the downstream cancels, immediately if it
    /// already has.
    fn on_cancel(&self, callback: TeardownCallback);

    /// Runs `callback` once when the processor is disposed, immediately if it
    /// already was.
    fn on_dispose(&self, callback: TeardownCallback);

    fn current_context(&self) -> Context;

    fn is_cancelled(&self) -> bool;

    /// Demand currently outstanding downstream; `u64::MAX` when unbounded.
    fn requested_from_downstream(&self) -> u64;
}

/// A teardown callback that fires at most once.
#[derive(Default)]
struct OnceHook {
    fired: AtomicBool,
    callback: Mutex<Option<TeardownCallback>>,
}

impl OnceHook {
    fn set(&self, callback: TeardownCallback) {
        let mut slot = self.callback.lock();
        if self.fired.load(Ordering::Acquire) {
            drop(slot);
            callback();
        } else {
            *slot = Some(callback);
        }
    }

    /// Returns `true` on the first call only.
    fn fire(&self) -> bool {
        let callback = {
            let mut slot = self.callback.lock();
            if self.fired.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Producer callbacks shared by every engine.
#[derive(Default)]
pub(crate) struct SinkHooks {
    on_request: RwLock<Option<Arc<dyn Fn(u64) + Send + Sync>>>,
    on_cancel: OnceHook,
    on_dispose: OnceHook,
    context: RwLock<Option<Context>>,
}

impl SinkHooks {
    pub(crate) fn set_on_request(&self, callback: RequestCallback, outstanding: u64) {
        let callback: Arc<dyn Fn(u64) + Send + Sync> = Arc::from(callback);
        *self.on_request.write() = Some(callback.clone());
        if outstanding > 0 {
            callback(outstanding);
        }
    }

    pub(crate) fn request_callback(&self) -> Option<Arc<dyn Fn(u64) + Send + Sync>> {
        self.on_request.read().clone()
    }

    pub(crate) fn fire_request(&self, n: u64) {
        if let Some(callback) = self.request_callback() {
            callback(n);
        }
    }

    pub(crate) fn set_on_cancel(&self, callback: TeardownCallback) {
        self.on_cancel.set(callback);
    }

    pub(crate) fn set_on_dispose(&self, callback: TeardownCallback) {
        self.on_dispose.set(callback);
    }

    pub(crate) fn fire_cancel(&self) -> bool {
        self.on_cancel.fire()
    }

    pub(crate) fn fire_dispose(&self) -> bool {
        self.on_dispose.fire()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.on_cancel.has_fired()
    }

    /// Remembers the first subscriber's context.
    pub(crate) fn adopt_context(&self, context: Context) {
        let mut slot = self.context.write();
        if slot.is_none() {
            *slot = Some(context);
        }
    }

    pub(crate) fn context(&self) -> Context {
        self.context.read().clone().unwrap_or_default()
    }
}
