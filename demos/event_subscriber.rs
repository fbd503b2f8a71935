//! # Event Subscriber Example
//!
//! Attaches the built-in [`LogWriter`] and a counting subscriber to a topic and a
//! subscription, then walks through a nack, a redelivery and a shutdown.
//!
//! Requires the `logging` feature:
//! ```bash
//! RUST_LOG=debug cargo run --example event_subscriber --features logging
//! ```

use std::{
    sync::Arc,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use pubport::mem::{MemSubscription, MemTopic};
use pubport::{Event, EventKind, LogWriter, Message, Subscribe, Subscription, Topic};

#[derive(Default)]
struct Counter {
    batches: AtomicU64,
    acks: AtomicU64,
    shutdowns: AtomicU64,
}

#[async_trait::async_trait]
impl Subscribe for Counter {
    async fn on_event(&self, e: &Event) {
        let slot = match (e.kind, e.op) {
            (EventKind::BatchDispatched, Some("send_acks")) => &self.acks,
            (EventKind::BatchDispatched, _) => &self.batches,
            (EventKind::TopicShutdown | EventKind::SubscriptionShutdown, _) => &self.shutdowns,
            _ => return,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "counter"
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let counter = Arc::new(Counter::default());
    let subscribers = || -> Vec<Arc<dyn Subscribe>> {
        vec![
            Arc::new(LogWriter::new()) as Arc<dyn Subscribe>,
            counter.clone() as Arc<dyn Subscribe>,
        ]
    };

    let broker = MemTopic::new();
    let sub = Subscription::builder(MemSubscription::new(&broker, Duration::from_secs(5)))
        .with_subscribers(subscribers())
        .build();
    let topic = Topic::builder(broker)
        .with_subscribers(subscribers())
        .build();
    let ctx = CancellationToken::new();

    topic.send(&ctx, Message::new("first")).await?;
    topic.send(&ctx, Message::new("second")).await?;

    let msg = sub.receive(&ctx).await?;
    println!("[consumer] nack {:?}", String::from_utf8_lossy(msg.body()));
    msg.nack();

    for _ in 0..2 {
        let msg = sub.receive(&ctx).await?;
        println!("[consumer] ack {:?}", String::from_utf8_lossy(msg.body()));
        msg.ack();
    }

    topic.shutdown(&ctx).await?;
    sub.shutdown(&ctx).await?;

    println!();
    println!("Events:");
    println!(" ├─► Batches:   {}", counter.batches.load(Ordering::Relaxed));
    println!(" ├─► Ack calls: {}", counter.acks.load(Ordering::Relaxed));
    println!(" └─► Shutdowns: {}", counter.shutdowns.load(Ordering::Relaxed));
    Ok(())
}
