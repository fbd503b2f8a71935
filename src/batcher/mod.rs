//! # Generic asynchronous batcher.
//!
//! [`Batcher`] groups items added by many callers into batches and hands each
//! batch to a single handler function. The handler's result is broadcast to
//! every caller whose item was in that batch.
//!
//! ## Architecture
//! ```text
//! add(item) ─┐
//! add(item) ─┼──► pending (FIFO) ──► ready? ──► handler slot (≤ max_handlers)
//! add(item) ─┘        ▲                              │
//!                     │                              ▼
//!                     └─── next ready batch ◄── handler(Vec<T>) ──► result to every waiter
//! ```
//!
//! ## Rules
//! - A batch is ready when a handler slot is free and at least `min_batch_size`
//!   items are pending. With `linger > 0` a non-full batch also waits for the
//!   linger window (or for a running handler to finish).
//! - A running handler keeps draining batches until none is ready.
//! - Batches hold at most `max_batch_size` items and `max_batch_byte_size` bytes,
//!   and always at least one item.
//! - After [`Batcher::shutdown`] no items are accepted and everything pending is
//!   dispatched regardless of `min_batch_size`.
//! - A caller whose context is cancelled gets [`Error::Canceled`]; its item is
//!   withdrawn unless a handler already took it.

mod options;

pub use options::{BatcherOptions, split};

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCode};

/// Item that can be batched.
pub trait BatchItem: Send + 'static {
    /// Size in bytes counted against `max_batch_byte_size`.
    fn byte_size(&self) -> usize {
        0
    }
}

type Handler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

struct Waiting<T> {
    id: u64,
    item: T,
    size: usize,
    done: oneshot::Sender<Result<(), Error>>,
}

struct State<T> {
    pending: VecDeque<Waiting<T>>,
    pending_bytes: usize,
    handlers: usize,
    next_id: u64,
    shutdown: bool,
    linger_armed: bool,
}

impl<T> State<T> {
    fn is_full(&self, opts: &BatcherOptions) -> bool {
        (opts.max_batch_size > 0 && self.pending.len() >= opts.max_batch_size)
            || (opts.max_batch_byte_size > 0 && self.pending_bytes >= opts.max_batch_byte_size)
    }

    fn is_idle(&self) -> bool {
        self.handlers == 0 && self.pending.is_empty()
    }

    /// Pops the next batch if one is ready.
    ///
    /// `lingered` means the items already waited long enough for more company.
    fn take_batch(&mut self, opts: &BatcherOptions, lingered: bool) -> Option<Vec<Waiting<T>>> {
        if self.pending.is_empty() {
            return None;
        }
        if !self.shutdown {
            if self.pending.len() < opts.min_size() {
                return None;
            }
            if !lingered && !opts.linger.is_zero() && !self.is_full(opts) {
                return None;
            }
        }

        let mut batch = Vec::new();
        let mut bytes = 0usize;
        while let Some(front) = self.pending.front() {
            if opts.max_batch_size > 0 && batch.len() >= opts.max_batch_size {
                break;
            }
            if opts.max_batch_byte_size > 0
                && !batch.is_empty()
                && bytes + front.size > opts.max_batch_byte_size
            {
                break;
            }
            bytes += front.size;
            if let Some(w) = self.pending.pop_front() {
                batch.push(w);
            }
        }
        self.pending_bytes -= bytes;
        Some(batch)
    }
}

struct Inner<T> {
    opts: BatcherOptions,
    handler: Handler<T>,
    state: Mutex<State<T>>,
    idle: Notify,
}

impl<T: BatchItem> Inner<T> {
    /// Starts handlers for ready batches while slots are free.
    fn dispatch(self: &Arc<Self>, st: &mut State<T>, lingered: bool) {
        while st.handlers < self.opts.handler_limit() {
            let Some(batch) = st.take_batch(&self.opts, lingered) else {
                break;
            };
            st.handlers += 1;
            tokio::spawn(Arc::clone(self).run(batch));
        }

        let waiting = !st.pending.is_empty() && st.handlers < self.opts.handler_limit();
        if waiting && !st.shutdown && !self.opts.linger.is_zero() && !st.linger_armed {
            st.linger_armed = true;
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(inner.opts.linger).await;
                let mut st = inner.state.lock();
                st.linger_armed = false;
                inner.dispatch(&mut st, true);
            });
        }
    }

    async fn run(self: Arc<Self>, mut batch: Vec<Waiting<T>>) {
        loop {
            let mut items = Vec::with_capacity(batch.len());
            let mut waiters = Vec::with_capacity(batch.len());
            for w in batch {
                items.push(w.item);
                waiters.push(w.done);
            }

            let fut = (self.handler)(items);
            let res = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(res) => res,
                Err(_) => {
                    tracing::error!("batch handler panicked");
                    Err(Error::driver(ErrorCode::Internal, "batch handler panicked".into()))
                }
            };
            for tx in waiters {
                let _ = tx.send(res.clone());
            }

            let mut st = self.state.lock();
            match st.take_batch(&self.opts, true) {
                Some(next) => batch = next,
                None => {
                    st.handlers -= 1;
                    if st.is_idle() {
                        self.idle.notify_waiters();
                    }
                    return;
                }
            }
        }
    }
}

/// Groups items into batches and runs a handler on each batch.
///
/// Cloning is cheap; clones share the same pending queue and handler slots.
pub struct Batcher<T: BatchItem> {
    inner: Arc<Inner<T>>,
}

impl<T: BatchItem> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BatchItem> fmt::Debug for Batcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Batcher")
            .field("opts", &self.inner.opts)
            .field("pending", &st.pending.len())
            .field("handlers", &st.handlers)
            .field("shutdown", &st.shutdown)
            .finish()
    }
}

impl<T: BatchItem> Batcher<T> {
    /// Creates a batcher that passes each batch to `handler`.
    ///
    /// Handlers are spawned on the current tokio runtime.
    pub fn new<F, Fut>(opts: BatcherOptions, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |items| handler(items).boxed());
        Self {
            inner: Arc::new(Inner {
                opts,
                handler,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    pending_bytes: 0,
                    handlers: 0,
                    next_id: 0,
                    shutdown: false,
                    linger_armed: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Options this batcher was built with.
    pub fn options(&self) -> &BatcherOptions {
        &self.inner.opts
    }

    /// Adds an item and waits for the result of the batch that carried it.
    ///
    /// # Errors
    /// - [`Error::InvalidArgument`] if the item exceeds `max_batch_byte_size`;
    /// - [`Error::BatcherShutdown`] after [`shutdown`](Self::shutdown);
    /// - [`Error::Canceled`] if `ctx` is cancelled before the batch completes;
    /// - whatever the handler returned for the batch.
    pub async fn add(&self, ctx: &CancellationToken, item: T) -> Result<(), Error> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        let (id, rx) = self.enqueue(item)?;
        tokio::select! {
            res = rx => res.unwrap_or(Err(Error::BatcherShutdown)),
            _ = ctx.cancelled() => {
                self.withdraw(id);
                Err(Error::Canceled)
            }
        }
    }

    /// Adds an item without waiting for its batch.
    ///
    /// # Errors
    /// Same validation errors as [`add`](Self::add); handler errors are not reported.
    pub fn add_no_wait(&self, item: T) -> Result<(), Error> {
        self.enqueue(item).map(|_| ())
    }

    /// Stops accepting items, dispatches everything pending and waits for all handlers.
    pub async fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock();
            st.shutdown = true;
            self.inner.dispatch(&mut st, true);
        }
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn enqueue(&self, item: T) -> Result<(u64, oneshot::Receiver<Result<(), Error>>), Error> {
        let opts = &self.inner.opts;
        let size = item.byte_size();
        if opts.max_batch_byte_size > 0 && size > opts.max_batch_byte_size {
            return Err(Error::invalid_argument(format!(
                "item of {size} bytes exceeds the maximum batch size of {} bytes",
                opts.max_batch_byte_size
            )));
        }

        let mut st = self.inner.state.lock();
        if st.shutdown {
            return Err(Error::BatcherShutdown);
        }
        let id = st.next_id;
        st.next_id += 1;
        let (done, rx) = oneshot::channel();
        st.pending.push_back(Waiting {
            id,
            item,
            size,
            done,
        });
        st.pending_bytes += size;
        self.inner.dispatch(&mut st, false);
        Ok((id, rx))
    }

    /// Removes a still-pending item. Returns `false` if a handler already took it.
    fn withdraw(&self, id: u64) -> bool {
        let mut st = self.inner.state.lock();
        let Some(pos) = st.pending.iter().position(|w| w.id == id) else {
            return false;
        };
        if let Some(w) = st.pending.remove(pos) {
            st.pending_bytes -= w.size;
        }
        if st.is_idle() {
            self.inner.idle.notify_waiters();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Item(usize);

    impl BatchItem for Item {
        fn byte_size(&self) -> usize {
            self.0
        }
    }

    fn recording(opts: BatcherOptions) -> (Batcher<Item>, Arc<Mutex<Vec<Vec<usize>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let b = Batcher::new(opts, move |items: Vec<Item>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(items.into_iter().map(|i| i.0).collect());
                Ok(())
            }
        });
        (b, seen)
    }

    #[tokio::test]
    async fn test_add_waits_for_handler() {
        let (b, seen) = recording(BatcherOptions::default());
        let ctx = CancellationToken::new();
        b.add(&ctx, Item(7)).await.expect("add");
        assert_eq!(*seen.lock(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_every_item_of_the_batch() {
        let b = Batcher::new(
            BatcherOptions {
                min_batch_size: 3,
                ..Default::default()
            },
            |_items: Vec<Item>| async { Err(Error::invalid_argument("nope")) },
        );
        let ctx = CancellationToken::new();
        let (a, bb, c) = tokio::join!(
            b.add(&ctx, Item(1)),
            b.add(&ctx, Item(2)),
            b.add(&ctx, Item(3))
        );
        for res in [a, bb, c] {
            assert_eq!(res.unwrap_err().code(), ErrorCode::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn test_batches_respect_size_limits() {
        let (b, seen) = recording(BatcherOptions {
            max_batch_size: 3,
            max_batch_byte_size: 10,
            ..Default::default()
        });
        // The first item occupies the single handler while the rest queue up.
        for n in [1, 1, 1, 1, 6, 6, 2] {
            b.add_no_wait(Item(n)).expect("add");
        }
        b.shutdown().await;

        let batches = seen.lock().clone();
        assert_eq!(batches.iter().flatten().count(), 7);
        for batch in &batches {
            assert!(!batch.is_empty() && batch.len() <= 3);
            assert!(batch.iter().sum::<usize>() <= 10);
        }
    }

    #[tokio::test]
    async fn test_oversize_item_is_rejected() {
        let (b, _) = recording(BatcherOptions {
            max_batch_byte_size: 4,
            ..Default::default()
        });
        let err = b.add_no_wait(Item(5)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_min_batch_size_holds_until_shutdown() {
        let (b, seen) = recording(BatcherOptions {
            min_batch_size: 10,
            ..Default::default()
        });
        b.add_no_wait(Item(1)).expect("add");
        b.add_no_wait(Item(2)).expect("add");
        tokio::task::yield_now().await;
        assert!(seen.lock().is_empty());

        b.shutdown().await;
        assert_eq!(*seen.lock(), vec![vec![1, 2]]);
        assert!(matches!(b.add_no_wait(Item(3)), Err(Error::BatcherShutdown)));
    }

    #[tokio::test]
    async fn test_cancel_withdraws_pending_item() {
        let (b, seen) = recording(BatcherOptions {
            min_batch_size: 2,
            ..Default::default()
        });
        let ctx = CancellationToken::new();
        let (b2, c2) = (b.clone(), ctx.clone());
        let task = tokio::spawn(async move { b2.add(&c2, Item(1)).await });
        tokio::task::yield_now().await;
        ctx.cancel();
        assert!(task.await.expect("join").unwrap_err().is_canceled());

        b.shutdown().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_limit_is_respected() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let b = Batcher::new(
            BatcherOptions {
                max_handlers: 2,
                max_batch_size: 1,
                ..Default::default()
            },
            move |_items: Vec<Item>| {
                let (r, p) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    r.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );
        for i in 0..8 {
            b.add_no_wait(Item(i)).expect("add");
        }
        b.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_collects_items() {
        let (b, seen) = recording(BatcherOptions {
            linger: Duration::from_millis(50),
            ..Default::default()
        });
        b.add_no_wait(Item(1)).expect("add");
        b.add_no_wait(Item(2)).expect("add");
        tokio::task::yield_now().await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_the_batch() {
        let b = Batcher::new(BatcherOptions::default(), |items: Vec<Item>| async move {
            if !items.is_empty() {
                panic!("handler blew up");
            }
            Ok(())
        });
        let ctx = CancellationToken::new();
        let err = b.add(&ctx, Item(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        b.shutdown().await;
    }
}
