//! # Round Trip Example
//!
//! Publishes a burst of messages to an in-memory topic and consumes them with
//! several concurrent receivers sharing one subscription.
//!
//! Flow:
//! - `send` 200 messages (batched, up to 32 per driver call)
//! - 4 workers `receive` and `ack` until every message was seen
//! - `shutdown` flushes the pending acks
//!
//! ## Run
//! ```bash
//! cargo run --example round_trip
//! ```

use std::{
    sync::Arc,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use pubport::mem::{MemSubscription, MemTopic};
use pubport::{BatcherOptions, Message, Subscription, Topic, TopicOptions};

const TOTAL: usize = 200;
const WORKERS: usize = 4;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let broker = MemTopic::new();
    let sub = Arc::new(Subscription::new(MemSubscription::new(
        &broker,
        Duration::from_secs(30),
    )));
    let topic = Topic::builder(broker)
        .with_options(TopicOptions {
            batcher: BatcherOptions {
                max_handlers: 2,
                max_batch_size: 32,
                ..Default::default()
            },
            ..Default::default()
        })
        .build();
    let ctx = CancellationToken::new();

    let sends = (0..TOTAL).map(|i| {
        let msg = Message::new(format!("order-{i}")).with_metadata("seq", i.to_string());
        topic.send(&ctx, msg)
    });
    futures::future::try_join_all(sends).await?;
    println!("[producer] sent {TOTAL} messages");

    let seen = Arc::new(AtomicUsize::new(0));
    let done = CancellationToken::new();
    let mut workers = Vec::with_capacity(WORKERS);
    for id in 0..WORKERS {
        let (sub, seen, done) = (Arc::clone(&sub), Arc::clone(&seen), done.clone());
        workers.push(tokio::spawn(async move {
            let mut mine = 0usize;
            while let Ok(msg) = sub.receive(&done).await {
                msg.ack();
                mine += 1;
                if seen.fetch_add(1, Ordering::Relaxed) + 1 == TOTAL {
                    done.cancel();
                }
            }
            println!("[worker-{id}] handled {mine}");
        }));
    }
    for w in workers {
        w.await?;
    }

    topic.shutdown(&ctx).await?;
    sub.shutdown(&ctx).await?;

    println!();
    println!("Summary:");
    println!(" ├─► Received: {}", seen.load(Ordering::Relaxed));
    if let Some(mem) = sub.as_driver::<MemSubscription>() {
        println!(" └─► Unacked:  {}", mem.outstanding());
    }
    Ok(())
}
