//! Strategies for waiting on a condition that another task will make true.
//!
//! Every waiter follows the same protocol: it registers interest on a
//! [`Notify`] *before* re-checking the condition, so a `notify_waiters`
//! issued between the check and the await is never lost. Strategies differ
//! only in how much CPU they burn before falling back to that park.

use crate::config::{DEFAULT_SPIN_TRIES, DEFAULT_YIELD_TRIES};
use crate::error::ProcessorError;
use std::hint;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Spins between two scheduler yields while busy-spinning, so a
/// single-threaded runtime still makes progress.
const SPIN_BATCH: u32 = 64;

/// How a waiting producer or consumer passes time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Re-check in a tight loop.
    BusySpin,
    /// Re-check after every scheduler yield.
    Yielding,
    /// Park until notified.
    Blocking,
    /// Park until notified, re-checking at least once per period.
    LiteTimeout(Duration),
    /// Spin, then yield, then park.
    PhasedBackoff { spin_tries: u32, yield_tries: u32 },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::PhasedBackoff {
            spin_tries: DEFAULT_SPIN_TRIES,
            yield_tries: DEFAULT_YIELD_TRIES,
        }
    }
}

impl WaitStrategy {
    /// Waits until `ready()` returns `true`.
    ///
    /// Returns [`ProcessorError::Cancelled`] if `cancel` fires first.
    pub(crate) async fn wait_until<F>(
        &self,
        notify: &Notify,
        cancel: &CancellationToken,
        mut ready: F,
    ) -> Result<(), ProcessorError>
    where
        F: FnMut() -> bool + Send,
    {
        match *self {
            WaitStrategy::BusySpin => {
                let mut spins = 0u32;
                loop {
                    if ready() {
                        return Ok(());
                    }
                    if cancel.is_cancelled() {
                        return Err(ProcessorError::Cancelled);
                    }
                    spins = spins.wrapping_add(1);
                    if spins % SPIN_BATCH == 0 {
                        tokio::task::yield_now().await;
                    } else {
                        hint::spin_loop();
                    }
                }
            }
            WaitStrategy::Yielding => loop {
                if ready() {
                    return Ok(());
                }
                if cancel.is_cancelled() {
                    return Err(ProcessorError::Cancelled);
                }
                tokio::task::yield_now().await;
            },
            WaitStrategy::Blocking => park(notify, cancel, None, ready).await,
            WaitStrategy::LiteTimeout(period) => park(notify, cancel, Some(period), ready).await,
            WaitStrategy::PhasedBackoff {
                spin_tries,
                yield_tries,
            } => {
                for i in 0..spin_tries {
                    if ready() {
                        return Ok(());
                    }
                    if (i + 1) % SPIN_BATCH == 0 {
                        if cancel.is_cancelled() {
                            return Err(ProcessorError::Cancelled);
                        }
                        tokio::task::yield_now().await;
                    } else {
                        hint::spin_loop();
                    }
                }
                for _ in 0..yield_tries {
                    if ready() {
                        return Ok(());
                    }
                    if cancel.is_cancelled() {
                        return Err(ProcessorError::Cancelled);
                    }
                    tokio::task::yield_now().await;
                }
                park(notify, cancel, None, ready).await
            }
        }
    }
}

async fn park<F>(
    notify: &Notify,
    cancel: &CancellationToken,
    period: Option<Duration>,
    mut ready: F,
) -> Result<(), ProcessorError>
where
    F: FnMut() -> bool + Send,
{
    loop {
        let notified = notify.notified();

        if ready() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(ProcessorError::Cancelled);
        }

        match period {
            Some(period) => {
                tokio::select! {
                    _ = notified => {}
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(period) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = notified => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}
