//! Dispatcher of a work-distributing fan-out.
//!
//! A single task owns the ring cursor. Each value goes to the next
//! subscriber, in arrival order, that has outstanding demand; subscribers
//! without demand are skipped rather than waited for. The terminal reaches
//! every subscriber still attached.

use crate::error::ProcessorError;
use crate::processor::fan_out::{FanOutInner, FanOutSubscription};
use crate::signal::{Signal, Terminal};
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(super) async fn run<T>(inner: Arc<FanOutInner<T>>, consumer: u64)
where
    T: Clone + Send + Sync + 'static,
{
    let bus = &inner.bus;
    let mut next = bus.position(consumer).unwrap_or(-1) + 1;
    let mut last_served = None;

    loop {
        let published = inner
            .wait
            .wait_until(&bus.consumer_notify, &inner.shutdown, || {
                bus.published() >= next
            })
            .await;
        if published.is_err() {
            break;
        }

        if !bus.buffer.holds_value(next) {
            let Some(signal) = bus.buffer.take(next) else {
                break;
            };
            let terminal = match signal.into_parts() {
                Ok(_) => break,
                Err(terminal) => terminal,
            };
            let subscribers = {
                let mut state = inner.state.lock();
                bus.advance(consumer, next);
                state.terminal_seq.get_or_insert(next);
                std::mem::take(&mut state.subscribers)
            };
            tracing::debug!(subscribers = subscribers.len(), "work queue reached its terminal");
            for subscriber in subscribers {
                subscriber.release();
                if !subscriber.cancelled.load(Ordering::Acquire) {
                    subscriber.finish(&terminal);
                }
            }
            return;
        }

        let mut picked: Option<Arc<FanOutSubscription<T>>> = None;
        let ready = inner
            .wait
            .wait_until(&inner.ready, &inner.shutdown, || {
                picked = inner.pick_ready(last_served);
                picked.is_some()
            })
            .await;
        let Some(subscriber) = picked.filter(|_| ready.is_ok()) else {
            break;
        };
        if !subscriber.demand.try_take() || subscriber.cancelled.load(Ordering::Acquire) {
            continue;
        }
        let Some(Signal::Next(value)) = bus.buffer.take(next) else {
            break;
        };

        subscriber.actual.on_next(value);
        last_served = Some(subscriber.serial);
        bus.advance(consumer, next);
        inner.report_progress();
        next += 1;
    }

    let remaining = std::mem::take(&mut inner.state.lock().subscribers);
    let disposed = inner.disposed.load(Ordering::Acquire);
    for subscriber in remaining {
        subscriber.release();
        if disposed && !subscriber.cancelled.load(Ordering::Acquire) {
            subscriber.finish(&Terminal::Error(ProcessorError::Disposed));
        }
    }
    tracing::trace!(position = next - 1, "work queue dispatcher stopped");
}
