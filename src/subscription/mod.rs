//! # Subscription: prefetching receive, batched acks.
//!
//! ## Architecture
//! ```text
//!   receive(ctx) ──► sticky error? ──► queue low and no receive in flight?
//!        │                                  └─► spawn background receive(n = sizer.next_batch_size())
//!        │                                         └─► split(n) ──► receive_batch × k (retried, concurrent)
//!        │                                                             └─► queue.extend, wake waiters
//!        ├─► queue non-empty ──► pop front ──► Message
//!        └─► queue empty ──► wait for the in-flight receive or ctx
//!
//!   Message::ack/nack ──► ack batcher ──► send_acks / send_nacks (retried, concurrent)
//!                                           └─► permanent error → sticky + unreported ack error
//! ```
//!
//! ## Rules
//! - At most one background receive is in flight; every waiting `receive` wakes when it ends.
//! - A permanent error (receive or ack) is returned by every later `receive`.
//! - An ack error not yet returned by `receive` is returned by `shutdown`.
//! - After [`Subscription::shutdown`] every later `receive` and `shutdown` returns
//!   [`Error::SubscriptionShutdown`].

mod sizer;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{try_join, try_join_all};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batcher::{Batcher, BatcherOptions, split};
use crate::config::SubscriptionOptions;
use crate::driver::{self, AckFn, AckId, AckInfo, Classify};
use crate::error::{Error, ErrorCode};
use crate::events::{Bus, Event, EventKind};
use crate::message::{Completion, Message};
use crate::policies::BackoffPolicy;
use crate::retry::{self, CallSite};
use crate::subscribers::{Hub, Subscribe};

use sizer::BatchSizer;

const COMPONENT: &str = "subscription";

/// How received messages are completed.
enum Acking {
    Batched(Batcher<AckInfo>),
    AtMostOnce(AckFn),
}

/// Receives messages from a subscription through a driver.
///
/// All methods take `&self`; `receive` may be called from many tasks at once.
pub struct Subscription {
    core: Arc<Core>,
    acking: Acking,
    hub: Hub,
}

/// State shared with the background receive and the ack batch handler.
struct Core {
    driver: Arc<dyn driver::Subscription>,
    state: Mutex<State>,
    background: CancellationToken,
    receive_batcher: BatcherOptions,
    retry: BackoffPolicy,
    at_least_once: bool,
    bus: Bus,
}

struct State {
    queue: VecDeque<driver::Message>,
    err: Option<Error>,
    unreported_ack_err: Option<Error>,
    /// Cancelled when the in-flight background receive finishes.
    receiving: Option<CancellationToken>,
    sizer: BatchSizer,
}

impl Subscription {
    /// Creates a subscription with default options.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(driver: impl driver::Subscription) -> Self {
        Self::builder(driver).build()
    }

    /// Starts building a subscription.
    pub fn builder(driver: impl driver::Subscription) -> SubscriptionBuilder {
        SubscriptionBuilder::new(Arc::new(driver))
    }

    /// Returns the next message, waiting for one if the local queue is empty.
    ///
    /// Retryable driver errors are retried forever, so an error means either a
    /// permanent failure or the caller's context ending.
    ///
    /// # Errors
    /// - the sticky error ([`Error::SubscriptionShutdown`] or a permanent receive/ack error);
    /// - [`Error::Canceled`] if `ctx` is cancelled; `receive` may be called again.
    pub async fn receive(&self, ctx: &CancellationToken) -> Result<Message, Error> {
        loop {
            let done = {
                let mut guard = self.core.state.lock();
                let st = &mut *guard;
                if let Some(err) = st.err.clone() {
                    st.unreported_ack_err = None;
                    return Err(err);
                }
                if ctx.is_cancelled() {
                    return Err(Error::Canceled);
                }

                if st.receiving.is_none() && st.sizer.wants_prefetch(st.queue.len()) {
                    let n = st.sizer.next_batch_size(Instant::now(), st.queue.len());
                    let done = CancellationToken::new();
                    st.receiving = Some(done.clone());
                    self.core.bus.publish(
                        Event::new(EventKind::BatchSizeUpdated)
                            .with_component(COMPONENT)
                            .with_batch_size(n),
                    );
                    tokio::spawn(Arc::clone(&self.core).receive_in_background(n, done));
                }

                if let Some(dm) = st.queue.pop_front() {
                    st.sizer.record_delivery();
                    drop(guard);
                    return Ok(self.wrap(dm));
                }

                st.sizer.record_empty(Instant::now());
                match &st.receiving {
                    Some(done) => done.clone(),
                    None => continue,
                }
            };

            tokio::select! {
                _ = done.cancelled() => {}
                _ = ctx.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    /// Flushes pending acks and releases the driver.
    ///
    /// # Errors
    /// - [`Error::SubscriptionShutdown`] if already shut down;
    /// - a wrapped error from the driver's `close`;
    /// - an ack/nack error that no `receive` returned yet;
    /// - [`Error::Canceled`] if `ctx` was cancelled (pending acks may be lost).
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), Error> {
        {
            let mut st = self.core.state.lock();
            if matches!(st.err, Some(Error::SubscriptionShutdown)) {
                return Err(Error::SubscriptionShutdown);
            }
            st.err = Some(Error::SubscriptionShutdown);
        }

        if let Acking::Batched(acks) = &self.acking {
            tokio::select! {
                _ = acks.shutdown() => {}
                _ = ctx.cancelled() => {
                    tracing::warn!("subscription shutdown cancelled before all acks were sent");
                }
            }
        }
        self.core.background.cancel();

        let driver = &self.core.driver;
        let res = match driver.close().await {
            Err(e) => Err(Error::driver(driver.error_code(&e), e)),
            Ok(()) => {
                let pending = self.core.state.lock().unreported_ack_err.take();
                match pending {
                    Some(e) => Err(e),
                    None if ctx.is_cancelled() => Err(Error::Canceled),
                    None => Ok(()),
                }
            }
        };

        let mut ev = Event::new(EventKind::SubscriptionShutdown).with_component(COMPONENT);
        if let Err(e) = &res {
            ev = ev.with_reason(e.to_string());
        }
        tracing::info!(ok = res.is_ok(), "subscription shut down");
        self.core.bus.publish(ev);
        self.hub.close().await;
        res
    }

    /// The driver, if it has concrete type `T`.
    pub fn as_driver<T: Any>(&self) -> Option<&T> {
        self.core.driver.as_any()?.downcast_ref::<T>()
    }

    /// The driver's native error inside `err`, if it has type `E`.
    pub fn error_as<'e, E>(&self, err: &'e Error) -> Option<&'e E>
    where
        E: std::error::Error + 'static,
    {
        err.driver_error::<E>()
    }

    /// Event bus of this subscription.
    pub fn bus(&self) -> &Bus {
        self.hub.bus()
    }

    fn wrap(&self, mut dm: driver::Message) -> Message {
        let completion = match &self.acking {
            Acking::AtMostOnce(ack_fn) => Completion::AtMostOnce(Arc::clone(ack_fn)),
            Acking::Batched(acks) => Completion::Batched {
                id: dm.ack_id.take().unwrap_or_else(|| AckId::new(())),
                acks: acks.clone(),
                bus: self.core.bus.clone(),
            },
        };
        Message::received(dm, completion)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.core.background.cancel();
    }
}

impl Core {
    async fn receive_in_background(self: Arc<Self>, n: usize, done: CancellationToken) {
        let res = self.next_batch(n).await;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            match res {
                Ok(msgs) if msgs.is_empty() => {}
                Ok(msgs) => {
                    st.queue.extend(msgs);
                    st.sizer.record_arrival(Instant::now());
                }
                Err(e) => {
                    if st.err.is_none() {
                        tracing::warn!(error = %e, "subscription failed permanently");
                        st.err = Some(e);
                    }
                }
            }
            st.receiving = None;
        }
        done.cancel();
    }

    /// Fetches up to `n` messages with concurrent driver calls; the first error wins.
    async fn next_batch(&self, n: usize) -> Result<Vec<driver::Message>, Error> {
        let ctx = &self.background;
        let driver = self.driver.as_ref();
        let site = CallSite {
            component: COMPONENT,
            op: "receive_batch",
        };
        let sizes = split(n.max(self.receive_batcher.min_size()), &self.receive_batcher);
        let calls = sizes.into_iter().map(|max| {
            retry::call(ctx, &self.retry, driver, site, &self.bus, move || {
                driver.receive_batch(ctx, max)
            })
        });
        let msgs: Vec<driver::Message> = try_join_all(calls).await?.into_iter().flatten().collect();

        if self.at_least_once && msgs.iter().any(|m| m.ack_id.is_none()) {
            return Err(Error::driver(
                ErrorCode::Internal,
                "driver returned a message without an ack id".into(),
            ));
        }
        Ok(msgs)
    }

    /// Ack batch handler: acks and nacks go out concurrently.
    async fn send_acks(&self, items: Vec<AckInfo>) -> Result<(), Error> {
        let total = items.len();
        let (acks, nacks): (Vec<AckInfo>, Vec<AckInfo>) = items.into_iter().partition(|a| a.is_ack);
        let acks: Vec<AckId> = acks.into_iter().map(|a| a.id).collect();
        let nacks: Vec<AckId> = nacks.into_iter().map(|a| a.id).collect();
        self.bus.publish(
            Event::new(EventKind::BatchDispatched)
                .with_component(COMPONENT)
                .with_op("send_acks")
                .with_batch_size(total),
        );

        let ctx = &self.background;
        let driver = self.driver.as_ref();
        let ack_site = CallSite {
            component: COMPONENT,
            op: "send_acks",
        };
        let nack_site = CallSite {
            component: COMPONENT,
            op: "send_nacks",
        };
        let send_acks = async {
            if acks.is_empty() {
                return Ok(());
            }
            retry::call(ctx, &self.retry, driver, ack_site, &self.bus, || {
                driver.send_acks(ctx, &acks)
            })
            .await
        };
        let send_nacks = async {
            if nacks.is_empty() {
                return Ok(());
            }
            retry::call(ctx, &self.retry, driver, nack_site, &self.bus, || {
                driver.send_nacks(ctx, &nacks)
            })
            .await
        };
        let res = try_join(send_acks, send_nacks).await.map(|_| ());

        if let Err(e) = &res {
            self.bus.publish(
                Event::new(EventKind::BatchFailed)
                    .with_component(COMPONENT)
                    .with_op("send_acks")
                    .with_batch_size(total)
                    .with_reason(e.to_string()),
            );
            if !e.is_canceled() {
                tracing::warn!(error = %e, "ack error stored");
                self.bus.publish(
                    Event::new(EventKind::AckErrorStored)
                        .with_component(COMPONENT)
                        .with_reason(e.to_string()),
                );
                let mut st = self.state.lock();
                if st.err.is_none() {
                    st.err = Some(e.clone());
                }
                st.unreported_ack_err = Some(e.clone());
            }
        }
        res
    }
}

/// Builder for [`Subscription`].
pub struct SubscriptionBuilder {
    driver: Arc<dyn driver::Subscription>,
    opts: SubscriptionOptions,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl SubscriptionBuilder {
    fn new(driver: Arc<dyn driver::Subscription>) -> Self {
        Self {
            driver,
            opts: SubscriptionOptions::default(),
            subscribers: Vec::new(),
        }
    }

    /// Replaces the options.
    pub fn with_options(mut self, opts: SubscriptionOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Sets event subscribers.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the subscription. Must be called from within a tokio runtime.
    pub fn build(self) -> Subscription {
        let hub = Hub::new(self.opts.bus_capacity, self.subscribers);
        let ack_fn = self.driver.ack_fn();
        let core = Arc::new(Core {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                err: None,
                unreported_ack_err: None,
                receiving: None,
                sizer: BatchSizer::new(self.opts.tuning, &self.opts.receive_batcher),
            }),
            driver: self.driver,
            background: CancellationToken::new(),
            receive_batcher: self.opts.receive_batcher,
            retry: self.opts.retry,
            at_least_once: ack_fn.is_none(),
            bus: hub.bus().clone(),
        });

        let acking = match ack_fn {
            Some(f) => Acking::AtMostOnce(f),
            None => {
                let handler_core = Arc::clone(&core);
                Acking::Batched(Batcher::new(
                    self.opts.ack_batcher,
                    move |items: Vec<AckInfo>| {
                        let core = Arc::clone(&handler_core);
                        async move { core.send_acks(items).await }
                    },
                ))
            }
        };

        Subscription { core, acking, hub }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Fail(&'static str);

    /// Serves `available` numbered messages, then blocks until cancelled.
    #[derive(Default)]
    struct Scripted {
        available: u64,
        next: AtomicU64,
        requested: Mutex<Vec<usize>>,
        acked: Mutex<Vec<u64>>,
        nacked: Mutex<Vec<u64>>,
        ack_error: Mutex<Option<&'static str>>,
        receive_error: Mutex<Option<&'static str>>,
        ack_fn_calls: Option<Arc<AtomicUsize>>,
    }

    impl Scripted {
        fn with(available: u64) -> Self {
            Self {
                available,
                ..Default::default()
            }
        }
    }

    impl Classify for Scripted {
        fn is_retryable(&self, err: &BoxError) -> bool {
            err.to_string() == "unavailable"
        }
        fn error_code(&self, _err: &BoxError) -> ErrorCode {
            ErrorCode::PermissionDenied
        }
    }

    fn ids(ids: &[AckId]) -> Vec<u64> {
        ids.iter().filter_map(|id| id.downcast_ref::<u64>().copied()).collect()
    }

    #[async_trait]
    impl driver::Subscription for Scripted {
        async fn receive_batch(
            &self,
            ctx: &CancellationToken,
            max_messages: usize,
        ) -> Result<Vec<driver::Message>, BoxError> {
            self.requested.lock().push(max_messages);
            if let Some(reason) = *self.receive_error.lock() {
                return Err(Box::new(Fail(reason)));
            }
            let mut out = Vec::new();
            while out.len() < max_messages {
                let n = self.next.fetch_add(1, Ordering::SeqCst);
                if n >= self.available {
                    break;
                }
                out.push(driver::Message::new(n.to_string()).with_ack_id(AckId::new(n)));
            }
            if out.is_empty() {
                ctx.cancelled().await;
                return Err(Box::new(Fail("cancelled")));
            }
            Ok(out)
        }

        async fn send_acks(&self, _ctx: &CancellationToken, acks: &[AckId]) -> Result<(), BoxError> {
            if let Some(reason) = *self.ack_error.lock() {
                return Err(Box::new(Fail(reason)));
            }
            self.acked.lock().extend(ids(acks));
            Ok(())
        }

        async fn send_nacks(&self, _ctx: &CancellationToken, acks: &[AckId]) -> Result<(), BoxError> {
            self.nacked.lock().extend(ids(acks));
            Ok(())
        }

        fn ack_fn(&self) -> Option<AckFn> {
            let calls = Arc::clone(self.ack_fn_calls.as_ref()?);
            Some(Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn as_any(&self) -> Option<&dyn Any> {
            Some(self)
        }
    }

    fn subscription(driver: Scripted) -> Subscription {
        Subscription::builder(driver)
            .with_options(SubscriptionOptions {
                retry: BackoffPolicy::immediate(),
                ..Default::default()
            })
            .build()
    }

    fn driver_of(s: &Subscription) -> &Scripted {
        s.as_driver::<Scripted>().expect("scripted driver")
    }

    #[tokio::test]
    async fn test_receive_and_ack() {
        let s = subscription(Scripted::with(3));
        let ctx = CancellationToken::new();
        for _ in 0..3 {
            s.receive(&ctx).await.expect("receive").ack();
        }
        s.shutdown(&ctx).await.expect("shutdown");

        let mut acked = driver_of(&s).acked.lock().clone();
        acked.sort();
        assert_eq!(acked, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_nack_goes_to_send_nacks() {
        let s = subscription(Scripted::with(2));
        let ctx = CancellationToken::new();
        s.receive(&ctx).await.expect("receive").nack();
        s.receive(&ctx).await.expect("receive").ack();
        s.shutdown(&ctx).await.expect("shutdown");

        let d = driver_of(&s);
        assert_eq!(d.nacked.lock().len() + d.acked.lock().len(), 2);
        assert_eq!(d.nacked.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_receive_can_be_retried() {
        let s = subscription(Scripted::with(0));
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = s.receive(&ctx).await.unwrap_err();
        assert!(err.is_canceled());

        let fresh = CancellationToken::new();
        fresh.cancel();
        assert!(s.receive(&fresh).await.unwrap_err().is_canceled());
        s.shutdown(&CancellationToken::new()).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_permanent_receive_error_is_sticky() {
        let driver = Scripted::with(5);
        *driver.receive_error.lock() = Some("denied");
        let s = subscription(driver);
        let ctx = CancellationToken::new();

        let err = s.receive(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
        assert_eq!(s.error_as::<Fail>(&err).map(|f| f.0), Some("denied"));

        *driver_of(&s).receive_error.lock() = None;
        let again = s.receive(&ctx).await.unwrap_err();
        assert_eq!(again.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_ack_error_surfaces_on_next_receive() {
        let driver = Scripted::with(10);
        *driver.ack_error.lock() = Some("denied");
        let s = subscription(driver);
        let ctx = CancellationToken::new();

        s.receive(&ctx).await.expect("receive").ack();
        let mut surfaced = None;
        for _ in 0..100 {
            match s.receive(&ctx).await {
                Ok(m) => m.nack(),
                Err(e) => {
                    surfaced = Some(e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let err = surfaced.expect("ack error surfaced");
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        // Reported by receive, so shutdown has nothing left to report.
        s.shutdown(&ctx).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_unreported_ack_error_is_returned_by_shutdown() {
        let driver = Scripted::with(1);
        *driver.ack_error.lock() = Some("denied");
        let s = subscription(driver);
        let ctx = CancellationToken::new();

        s.receive(&ctx).await.expect("receive").ack();
        let err = s.shutdown(&ctx).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_shutdown_is_sticky() {
        let s = subscription(Scripted::with(1));
        let ctx = CancellationToken::new();
        s.shutdown(&ctx).await.expect("shutdown");

        assert!(matches!(
            s.shutdown(&ctx).await,
            Err(Error::SubscriptionShutdown)
        ));
        assert!(matches!(
            s.receive(&ctx).await,
            Err(Error::SubscriptionShutdown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_receivers() {
        let s = Arc::new(subscription(Scripted::with(0)));
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.receive(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.shutdown(&CancellationToken::new()).await.expect("shutdown");

        let res = waiter.await.expect("join");
        assert!(matches!(res, Err(Error::SubscriptionShutdown)));
    }

    #[tokio::test]
    async fn test_at_most_once_uses_ack_fn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let driver = Scripted {
            available: 2,
            ack_fn_calls: Some(Arc::clone(&calls)),
            ..Default::default()
        };
        let s = subscription(driver);
        let ctx = CancellationToken::new();
        s.receive(&ctx).await.expect("receive").ack();
        s.receive(&ctx).await.expect("receive").ack();
        s.shutdown(&ctx).await.expect("shutdown");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(driver_of(&s).acked.lock().is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "at-most-once")]
    async fn test_nack_on_at_most_once_panics() {
        let driver = Scripted {
            available: 1,
            ack_fn_calls: Some(Arc::new(AtomicUsize::new(0))),
            ..Default::default()
        };
        let s = subscription(driver);
        s.receive(&CancellationToken::new()).await.expect("receive").nack();
    }

    #[tokio::test]
    async fn test_single_receive_options_request_one_message() {
        let s = Subscription::builder(Scripted::with(5))
            .with_options(SubscriptionOptions {
                receive_batcher: BatcherOptions::single(),
                retry: BackoffPolicy::immediate(),
                ..Default::default()
            })
            .build();
        let ctx = CancellationToken::new();
        for _ in 0..5 {
            s.receive(&ctx).await.expect("receive").ack();
        }
        assert!(driver_of(&s).requested.lock().iter().all(|&n| n == 1));
        s.shutdown(&ctx).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_receive_request_is_split() {
        let s = Subscription::builder(Scripted::with(1000))
            .with_options(SubscriptionOptions {
                receive_batcher: BatcherOptions {
                    max_handlers: 4,
                    max_batch_size: 2,
                    ..Default::default()
                },
                retry: BackoffPolicy::immediate(),
                tuning: crate::ReceiveTuning {
                    initial_batch_size: 7.0,
                    ..Default::default()
                },
                ..Default::default()
            })
            .build();
        let ctx = CancellationToken::new();
        s.receive(&ctx).await.expect("receive").ack();

        let mut first: Vec<usize> = driver_of(&s).requested.lock().iter().take(4).copied().collect();
        first.sort();
        assert_eq!(first, vec![1, 2, 2, 2]);
        s.shutdown(&ctx).await.expect("shutdown");
    }
}
