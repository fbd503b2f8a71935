//! # pubport
//!
//! **pubport** is a portable publish/subscribe client runtime.
//!
//! Applications talk to a [`Topic`] and a [`Subscription`]; a small driver
//! interface ([`driver`]) adapts each message broker. Batching, retries,
//! prefetching, ack batching, sticky error states and shutdown are handled
//! once, above the drivers.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!        app: send(ctx, msg)                         app: receive(ctx) / msg.ack()
//!               │                                              │
//!               ▼                                              ▼
//! ┌─────────────────────────────┐             ┌──────────────────────────────────┐
//! │  Topic                      │             │  Subscription                    │
//! │  - sticky error             │             │  - sticky error, unreported ack  │
//! │  - Batcher<driver::Message> │             │  - local queue + BatchSizer      │
//! └──────────────┬──────────────┘             │  - Batcher<AckInfo>              │
//!                │                            └───────┬──────────────────┬───────┘
//!                ▼                                    ▼                  ▼
//!         retry::call(send_batch)        retry::call(receive_batch)  retry::call(send_acks/nacks)
//!                │                                    │                  │
//!                ▼                                    ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────────────────┐
//! │          driver::Topic / driver::Subscription  (mem, or a broker adapter)     │
//! └───────────────────────────────────────────────────────────────────────────────┘
//!
//!   every component ── publish(Event) ──► Bus ──► listener ──► SubscriberSet ──► Subscribe
//! ```
//!
//! ### Message lifecycle
//! ```text
//! Topic::send ──► validate ──► batch ──► send_batch ──► broker
//!                                                          │
//! Subscription::receive ◄── queue ◄── background receive ◄─┘
//!        │
//!        └─► Message::ack / nack ──► ack batch ──► send_acks / send_nacks
//!            (at-most-once: ack runs the driver's ack_fn, nack panics)
//! ```
//!
//! ## Features
//! | Area              | Description                                                    | Key types / traits                         |
//! |-------------------|----------------------------------------------------------------|--------------------------------------------|
//! | **Publishing**    | Batched sends with a sticky terminal state.                    | [`Topic`], [`TopicBuilder`]                |
//! | **Receiving**     | Adaptive prefetch, batched acks, at-least/at-most-once.        | [`Subscription`], [`Message`]              |
//! | **Batching**      | Generic async batcher and request splitting.                   | [`Batcher`], [`BatcherOptions`], [`batcher::split`] |
//! | **Retries**       | Backoff with jitter around every driver call.                  | [`BackoffPolicy`], [`JitterPolicy`]        |
//! | **Drivers**       | Broker adapter traits and an in-memory implementation.         | [`driver::Topic`], [`driver::Subscription`], [`mem`] |
//! | **Errors**        | Portable error codes and the native-error escape hatch.        | [`Error`], [`ErrorCode`]                   |
//! | **Observability** | Runtime events fanned out to pluggable subscribers.            | [`Event`], [`Subscribe`]                   |
//!
//! ## Optional features
//! - `logging`: exports a built-in [`LogWriter`] subscriber that renders events through `tracing`.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use pubport::{Message, Subscription, Topic};
//! use pubport::mem::{MemSubscription, MemTopic};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pubport::Error> {
//!     let broker = MemTopic::new();
//!     let sub = Subscription::new(MemSubscription::new(&broker, Duration::from_secs(30)));
//!     let topic = Topic::new(broker);
//!     let ctx = CancellationToken::new();
//!
//!     topic.send(&ctx, Message::new("hello").with_metadata("lang", "en")).await?;
//!
//!     let msg = sub.receive(&ctx).await?;
//!     assert_eq!(msg.body(), b"hello");
//!     msg.ack();
//!
//!     topic.shutdown(&ctx).await?;
//!     sub.shutdown(&ctx).await?;
//!     Ok(())
//! }
//! ```
pub mod batcher;
mod config;
pub mod driver;
mod error;
mod events;
pub mod mem;
mod message;
mod policies;
pub mod retry;
mod subscribers;
mod subscription;
mod topic;

// ---- Public re-exports ----

pub use batcher::{BatchItem, Batcher, BatcherOptions};
pub use config::{ReceiveTuning, SubscriptionOptions, TopicOptions};
pub use error::{BoxError, Error, ErrorCode};
pub use events::{Bus, Event, EventKind};
pub use message::Message;
pub use policies::{BackoffPolicy, JitterPolicy};
pub use subscribers::{Subscribe, SubscriberSet};
pub use subscription::{Subscription, SubscriptionBuilder};
pub use topic::{Topic, TopicBuilder};

// Optional: expose a simple built-in logger subscriber.
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
