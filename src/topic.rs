//! # Topic: batched, retried publishing.
//!
//! ```text
//! send(ctx, msg) ──► sticky error? ──► metadata is text? ──► batcher.add(ctx, msg)
//!                                                                  │
//!                             batch handler ◄──────────────────────┘
//!                               └─► retry::call(send_batch)
//!                                     ├─ Ok            → Ok to every sender of the batch
//!                                     └─ permanent err → same err to every sender, kept as sticky
//! ```
//!
//! ## Rules
//! - After a permanent driver error every later `send` returns that error.
//! - After [`Topic::shutdown`] every later `send` and `shutdown` returns
//!   [`Error::TopicShutdown`].
//! - Messages are validated before they reach the batcher; an invalid message
//!   never reaches the driver.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::batcher::Batcher;
use crate::config::TopicOptions;
use crate::driver::{self, Classify};
use crate::error::Error;
use crate::events::{Bus, Event, EventKind};
use crate::message::Message;
use crate::retry::{self, CallSite};
use crate::subscribers::{Hub, Subscribe};

const COMPONENT: &str = "topic";

/// Sends messages to a topic through a driver.
///
/// All methods take `&self`; share a topic between tasks with `Arc<Topic>`.
pub struct Topic {
    driver: Arc<dyn driver::Topic>,
    batcher: Batcher<driver::Message>,
    err: Arc<Mutex<Option<Error>>>,
    background: CancellationToken,
    hub: Hub,
}

impl Topic {
    /// Creates a topic with default options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(driver: impl driver::Topic) -> Self {
        Self::builder(driver).build()
    }

    /// Starts building a topic.
    pub fn builder(driver: impl driver::Topic) -> TopicBuilder {
        TopicBuilder::new(Arc::new(driver))
    }

    /// Publishes a message.
    ///
    /// Returns once the batch holding the message was accepted by the driver.
    ///
    /// # Errors
    /// - the sticky error ([`Error::TopicShutdown`] or an earlier permanent driver error);
    /// - [`Error::InvalidArgument`] if a metadata key or value is not valid UTF-8;
    /// - [`Error::Canceled`] if `ctx` is cancelled first;
    /// - the permanent driver error of the batch.
    pub async fn send(&self, ctx: &CancellationToken, msg: Message) -> Result<(), Error> {
        if let Some(err) = self.err.lock().clone() {
            return Err(err);
        }
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        let dm = msg.into_driver()?;
        match self.batcher.add(ctx, dm).await {
            Err(Error::BatcherShutdown) => Err(Error::TopicShutdown),
            res => res,
        }
    }

    /// Flushes pending messages and releases the driver.
    ///
    /// # Errors
    /// - [`Error::TopicShutdown`] if the topic was already shut down;
    /// - a wrapped error from the driver's `close`;
    /// - [`Error::Canceled`] if `ctx` was cancelled (pending messages may be lost).
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), Error> {
        {
            let mut err = self.err.lock();
            if matches!(*err, Some(Error::TopicShutdown)) {
                return Err(Error::TopicShutdown);
            }
            *err = Some(Error::TopicShutdown);
        }

        tokio::select! {
            _ = self.batcher.shutdown() => {}
            _ = ctx.cancelled() => {
                tracing::warn!("topic shutdown cancelled before all messages were sent");
            }
        }
        self.background.cancel();

        let res = match self.driver.close().await {
            Err(e) => Err(Error::driver(self.driver.error_code(&e), e)),
            Ok(()) if ctx.is_cancelled() => Err(Error::Canceled),
            Ok(()) => Ok(()),
        };

        let mut ev = Event::new(EventKind::TopicShutdown).with_component(COMPONENT);
        if let Err(e) = &res {
            ev = ev.with_reason(e.to_string());
        }
        tracing::info!(ok = res.is_ok(), "topic shut down");
        self.hub.bus().publish(ev);
        self.hub.close().await;
        res
    }

    /// The driver, if it has concrete type `T`.
    pub fn as_driver<T: Any>(&self) -> Option<&T> {
        self.driver.as_any()?.downcast_ref::<T>()
    }

    /// The driver's native error inside `err`, if it has type `E`.
    pub fn error_as<'e, E>(&self, err: &'e Error) -> Option<&'e E>
    where
        E: std::error::Error + 'static,
    {
        err.driver_error::<E>()
    }

    /// Event bus of this topic.
    pub fn bus(&self) -> &Bus {
        self.hub.bus()
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Builder for [`Topic`].
pub struct TopicBuilder {
    driver: Arc<dyn driver::Topic>,
    opts: TopicOptions,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl TopicBuilder {
    fn new(driver: Arc<dyn driver::Topic>) -> Self {
        Self {
            driver,
            opts: TopicOptions::default(),
            subscribers: Vec::new(),
        }
    }

    /// Replaces the options.
    pub fn with_options(mut self, opts: TopicOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Sets event subscribers.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the topic. Must be called from within a tokio runtime.
    pub fn build(self) -> Topic {
        let hub = Hub::new(self.opts.bus_capacity, self.subscribers);
        let err = Arc::new(Mutex::new(None));
        let background = CancellationToken::new();

        let sender = SendBatch {
            driver: Arc::clone(&self.driver),
            err: Arc::clone(&err),
            background: background.clone(),
            retry: self.opts.retry,
            bus: hub.bus().clone(),
        };
        let sender = Arc::new(sender);
        let batcher = Batcher::new(self.opts.batcher, move |msgs: Vec<driver::Message>| {
            let sender = Arc::clone(&sender);
            async move { sender.run(msgs).await }
        });

        Topic {
            driver: self.driver,
            batcher,
            err,
            background,
            hub,
        }
    }
}

/// State captured by the send batch handler.
struct SendBatch {
    driver: Arc<dyn driver::Topic>,
    err: Arc<Mutex<Option<Error>>>,
    background: CancellationToken,
    retry: crate::policies::BackoffPolicy,
    bus: Bus,
}

impl SendBatch {
    async fn run(&self, msgs: Vec<driver::Message>) -> Result<(), Error> {
        let site = CallSite {
            component: COMPONENT,
            op: "send_batch",
        };
        self.bus.publish(
            Event::new(EventKind::BatchDispatched)
                .with_component(COMPONENT)
                .with_op(site.op)
                .with_batch_size(msgs.len()),
        );

        let ctx = &self.background;
        let driver = self.driver.as_ref();
        let res = retry::call(ctx, &self.retry, driver, site, &self.bus, || {
            driver.send_batch(ctx, &msgs)
        })
        .await;

        if let Err(e) = &res {
            self.bus.publish(
                Event::new(EventKind::BatchFailed)
                    .with_component(COMPONENT)
                    .with_op(site.op)
                    .with_batch_size(msgs.len())
                    .with_reason(e.to_string()),
            );
            if !e.is_canceled() {
                let mut sticky = self.err.lock();
                if sticky.is_none() {
                    tracing::warn!(error = %e, "topic failed permanently");
                    *sticky = Some(e.clone());
                }
            }
        }
        res
    }
}
