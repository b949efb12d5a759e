use fluxsink::{
    Emitter, FanOut, FanOutConfig, ProcessorError, Sink, Subscribable, Subscriber, Subscription,
    Terminal, UNBOUNDED, hooks,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Watcher {
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    terminal: Mutex<Option<Terminal>>,
}

impl Watcher {
    fn cancel(&self) {
        let subscription = self.subscription.lock().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

impl Subscriber<i32> for Watcher {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
        *self.subscription.lock() = Some(subscription);
    }

    fn on_next(&self, _value: i32) {}

    fn on_error(&self, error: ProcessorError) {
        *self.terminal.lock() = Some(Terminal::Error(error));
    }

    fn on_complete(&self) {
        *self.terminal.lock() = Some(Terminal::Complete);
    }
}

// Hooks are process-wide, so both engines are checked in this one test.
#[tokio::test]
async fn test_error_after_every_subscriber_cancelled_is_not_lost() {
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let d = dropped.clone();
    hooks::on_error_dropped(move |error| d.lock().push(error.as_label()));

    let emitter = Emitter::<i32>::new();
    let sub = Arc::new(Watcher::default());
    emitter.subscribe(sub.clone());
    emitter.next(1).await.unwrap();
    sub.cancel();
    assert!(emitter.is_cancelled());

    assert!(matches!(
        emitter.error(ProcessorError::InvalidConfig("boom".into())).await,
        Err(ProcessorError::Cancelled)
    ));
    assert_eq!(*dropped.lock(), vec!["invalid_config"]);
    let late = Arc::new(Watcher::default());
    emitter.subscribe(late.clone());
    assert!(matches!(*late.terminal.lock(), Some(Terminal::Complete)));

    let topic = FanOut::<i32>::topic(FanOutConfig {
        buffer_size: 4,
        ..Default::default()
    })
    .unwrap();
    let sub = Arc::new(Watcher::default());
    topic.subscribe(sub.clone());
    topic.next(1).await.unwrap();
    sub.cancel();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !topic.is_cancelled() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("the topic should auto-cancel");

    assert!(matches!(
        topic.error(ProcessorError::Overflow).await,
        Err(ProcessorError::Cancelled)
    ));
    assert_eq!(*dropped.lock(), vec!["invalid_config", "overflow"]);

    hooks::reset_on_error_dropped();
}
