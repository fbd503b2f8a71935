use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use pubport::mem::{MemSubscription, MemTopic};
use pubport::{
    BatcherOptions, Error, Event, EventKind, Message, Subscribe, Subscription, Topic,
    TopicOptions,
};

fn body(m: &Message) -> String {
    String::from_utf8(m.body().to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn round_trip_preserves_bodies_and_metadata() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(60)));
    let topic = Topic::builder(broker)
        .with_options(TopicOptions {
            batcher: BatcherOptions {
                max_batch_size: 16,
                ..Default::default()
            },
            ..Default::default()
        })
        .build();
    let ctx = CancellationToken::new();

    let sends = (0..100).map(|i| {
        let msg = Message::new(format!("m{i}")).with_metadata("index", i.to_string());
        topic.send(&ctx, msg)
    });
    try_join_all(sends).await.expect("send all");

    let mut got = Vec::new();
    for _ in 0..100 {
        let m = sub.receive(&ctx).await.expect("receive");
        assert_eq!(m.metadata_str("index"), Some(&body(&m)[1..]));
        got.push(body(&m));
        m.ack();
    }
    got.sort();
    let mut want: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
    want.sort();
    assert_eq!(got, want);

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_receivers_see_each_message_once() {
    const TOTAL: usize = 1000;

    let broker = MemTopic::new();
    let sub = Arc::new(Subscription::new(MemSubscription::new(
        &broker,
        Duration::from_secs(600),
    )));
    let topic = Topic::new(broker);
    let ctx = CancellationToken::new();

    let sends = (0..TOTAL).map(|i| topic.send(&ctx, Message::new(i.to_string())));
    try_join_all(sends).await.expect("send all");

    let seen = Arc::new(Mutex::new(Vec::with_capacity(TOTAL)));
    let done = CancellationToken::new();
    let receivers: Vec<_> = (0..10)
        .map(|_| {
            let (sub, seen, done) = (Arc::clone(&sub), Arc::clone(&seen), done.clone());
            tokio::spawn(async move {
                loop {
                    match sub.receive(&done).await {
                        Ok(m) => {
                            let n = {
                                let mut seen = seen.lock();
                                seen.push(body(&m));
                                seen.len()
                            };
                            m.ack();
                            if n == TOTAL {
                                done.cancel();
                            }
                        }
                        Err(e) => {
                            assert!(e.is_canceled(), "unexpected error: {e}");
                            return;
                        }
                    }
                }
            })
        })
        .collect();

    let finished =
        tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(receivers))
            .await
            .expect("receivers finished");
    for res in finished {
        res.expect("receiver task");
    }

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), TOTAL);
    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), TOTAL);

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");
    let mem = sub.as_driver::<MemSubscription>().expect("mem driver");
    assert_eq!(mem.outstanding(), 0);
}

#[tokio::test]
async fn nacked_message_comes_back() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(3600)));
    let topic = Topic::new(broker);
    let ctx = CancellationToken::new();

    topic.send(&ctx, Message::new("again")).await.expect("send");
    sub.receive(&ctx).await.expect("first").nack();
    let second = sub.receive(&ctx).await.expect("redelivered");
    assert_eq!(body(&second), "again");
    second.ack();

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");
}

#[tokio::test(start_paused = true)]
async fn dropped_message_is_redelivered_after_ack_deadline() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(1)));
    let topic = Topic::new(broker);
    let ctx = CancellationToken::new();
    let mut events = sub.bus().subscribe();

    topic.send(&ctx, Message::new("lost")).await.expect("send");
    drop(sub.receive(&ctx).await.expect("first"));

    let mut kinds = Vec::new();
    while let Ok(ev) = events.try_recv() {
        kinds.push(ev.kind);
    }
    assert!(kinds.contains(&EventKind::MessageNotAcked));

    let again = sub.receive(&ctx).await.expect("redelivered");
    assert_eq!(body(&again), "lost");
    again.ack();

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");
}

#[tokio::test]
async fn at_most_once_subscription() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::at_most_once(&broker));
    let topic = Topic::new(broker);
    let ctx = CancellationToken::new();

    topic.send(&ctx, Message::new("once")).await.expect("send");
    let m = sub.receive(&ctx).await.expect("receive");
    m.ack();
    let mem = sub.as_driver::<MemSubscription>().expect("mem driver");
    assert_eq!(mem.outstanding(), 0);

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");
}

#[tokio::test]
async fn shutdown_states_are_sticky() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(10)));
    let topic = Topic::new(broker);
    let ctx = CancellationToken::new();

    topic.shutdown(&ctx).await.expect("topic shutdown");
    sub.shutdown(&ctx).await.expect("subscription shutdown");

    assert!(matches!(
        topic.send(&ctx, Message::new("late")).await,
        Err(Error::TopicShutdown)
    ));
    assert!(matches!(topic.shutdown(&ctx).await, Err(Error::TopicShutdown)));
    assert!(matches!(
        sub.receive(&ctx).await,
        Err(Error::SubscriptionShutdown)
    ));
    assert!(matches!(
        sub.shutdown(&ctx).await,
        Err(Error::SubscriptionShutdown)
    ));
}

#[tokio::test]
async fn receive_honors_cancellation() {
    let broker = MemTopic::new();
    let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(10)));
    let ctx = CancellationToken::new();

    let deadline = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        deadline.cancel();
    });
    let err = sub.receive(&ctx).await.unwrap_err();
    assert!(err.is_canceled());
    sub.shutdown(&CancellationToken::new())
        .await
        .expect("subscription shutdown");
}

#[derive(Default)]
struct Recorder {
    kinds: Mutex<Vec<EventKind>>,
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &Event) {
        self.kinds.lock().push(event.kind);
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

#[tokio::test]
async fn subscribers_observe_runtime_events() {
    let recorder = Arc::new(Recorder::default());
    let topic = Topic::builder(MemTopic::new())
        .with_subscribers(vec![recorder.clone() as Arc<dyn Subscribe>])
        .build();
    let ctx = CancellationToken::new();

    topic.send(&ctx, Message::new("x")).await.expect("send");
    topic.shutdown(&ctx).await.expect("shutdown");

    let kinds = recorder.kinds.lock().clone();
    assert!(kinds.contains(&EventKind::BatchDispatched));
    assert_eq!(kinds.last(), Some(&EventKind::TopicShutdown));
}
