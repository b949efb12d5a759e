//! Per-subscriber worker of a broadcasting fan-out.

use crate::error::ProcessorError;
use crate::processor::fan_out::{FanOutInner, FanOutSubscription};
use crate::signal::Terminal;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Follows the ring from `start + 1`, delivering values as demand allows,
/// until the terminal is reached or the subscription is cancelled.
pub(super) async fn run<T>(
    inner: Arc<FanOutInner<T>>,
    subscriber: Arc<FanOutSubscription<T>>,
    start: i64,
) where
    T: Clone + Send + Sync + 'static,
{
    let Some(consumer) = subscriber.consumer else {
        return;
    };
    let bus = &inner.bus;
    let mut next = start + 1;

    loop {
        if subscriber.token.is_cancelled() {
            break;
        }
        let published = inner
            .wait
            .wait_until(&bus.consumer_notify, &subscriber.token, || {
                bus.published() >= next
            })
            .await;
        if published.is_err() {
            break;
        }

        let Some(signal) = bus.buffer.read(next) else {
            // Taken by a forced disposal.
            break;
        };
        match signal.into_parts() {
            Ok(value) => {
                let demanded = inner
                    .wait
                    .wait_until(&subscriber.notify, &subscriber.token, || {
                        subscriber.demand.get() > 0
                    })
                    .await;
                if demanded.is_err() {
                    break;
                }
                {
                    // Disposal hands out every value past the slowest cursor,
                    // so the cursor moves before this one is delivered.
                    let _delivering = inner.delivery.read();
                    if inner.disposed.load(Ordering::Acquire)
                        || subscriber.token.is_cancelled()
                        || !subscriber.demand.try_take()
                    {
                        break;
                    }
                    bus.advance(consumer, next);
                }
                subscriber.actual.on_next(value);
                inner.report_progress();
                next += 1;
            }
            Err(terminal) => {
                bus.advance(consumer, next);
                subscriber.finish(&terminal);
                break;
            }
        }
    }

    let user_cancelled = subscriber.cancelled.load(Ordering::Acquire);
    if !user_cancelled && inner.disposed.load(Ordering::Acquire) {
        subscriber.finish(&Terminal::Error(ProcessorError::Disposed));
    }
    tracing::trace!(position = next - 1, "topic worker stopped");
    inner.leave(&subscriber);
}

#[cfg(test)]
mod tests {
    use crate::config::FanOutConfig;
    use crate::processor::FanOut;
    use crate::signal::Terminal;
    use crate::sink::Sink;
    use crate::subscriber::Subscribable;
    use crate::test_support::TestSubscriber;

    #[tokio::test]
    async fn test_late_topic_subscriber_starts_at_publication_point() {
        let topic = FanOut::<i32>::topic(FanOutConfig {
            buffer_size: 8,
            ..Default::default()
        })
        .unwrap();
        let early = TestSubscriber::<i32>::unbounded();
        topic.subscribe(early.clone());
        topic.next(1).await.unwrap();
        early.await_values(1).await;

        let late = TestSubscriber::<i32>::unbounded();
        topic.subscribe(late.clone());
        topic.next(2).await.unwrap();
        topic.complete().await.unwrap();

        assert!(matches!(late.await_terminal().await, Terminal::Complete));
        assert_eq!(late.values(), vec![2]);
        assert_eq!(early.await_values(2).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_subscriber_after_completion_gets_terminal() {
        let topic = FanOut::<i32>::topic(FanOutConfig {
            buffer_size: 4,
            ..Default::default()
        })
        .unwrap();
        let sub = TestSubscriber::<i32>::unbounded();
        topic.subscribe(sub.clone());
        topic.next(1).await.unwrap();
        topic.complete().await.unwrap();
        sub.await_terminal().await;

        let late = TestSubscriber::<i32>::unbounded();
        topic.subscribe(late.clone());
        assert!(late.is_completed());
        assert!(late.values().is_empty());
    }
}
