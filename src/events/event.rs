//! # Runtime events emitted by topics, subscriptions and their helpers.
//!
//! [`EventKind`] classifies what happened; [`Event`] carries the optional details
//! (component, driver operation, attempt, delay, batch size, reason).
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use pubport::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::RetryScheduled)
//!     .with_component("topic")
//!     .with_op("send_batch")
//!     .with_attempt(2)
//!     .with_delay(Duration::from_millis(250))
//!     .with_reason("connection reset");
//!
//! assert_eq!(ev.kind, EventKind::RetryScheduled);
//! assert_eq!(ev.op, Some("send_batch"));
//! assert_eq!(ev.delay_ms, Some(250));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Batching ===
    /// A batch was handed to a batch handler.
    ///
    /// Sets: `component`, `op`, `batch_size`.
    BatchDispatched,

    /// A batch handler returned an error; every item of the batch got it.
    ///
    /// Sets: `component`, `op`, `batch_size`, `reason`.
    BatchFailed,

    // === Driver calls ===
    /// A driver call failed with a retryable error; a new attempt is scheduled.
    ///
    /// Sets: `component`, `op`, `attempt` (failed attempt, 1-based), `delay_ms`, `reason`.
    RetryScheduled,

    // === Subscription ===
    /// The subscription picked the size of its next background receive.
    ///
    /// Sets: `component`, `batch_size`.
    BatchSizeUpdated,

    /// A permanent ack/nack error was stored; it surfaces on the next receive/shutdown.
    ///
    /// Sets: `component`, `reason`.
    AckErrorStored,

    /// A received at-least-once message was dropped without ack or nack.
    ///
    /// Sets: `component`.
    MessageNotAcked,

    // === Shutdown ===
    /// A topic finished its shutdown sequence.
    ///
    /// Sets: `component`, `reason` (only when shutdown ended with an error).
    TopicShutdown,

    /// A subscription finished its shutdown sequence.
    ///
    /// Sets: `component`, `reason` (only when shutdown ended with an error).
    SubscriptionShutdown,

    // === Subscribers ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `component` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `component` (subscriber name), `reason`.
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Emitting component ("topic", "subscription", a subscriber name...).
    pub component: Option<Arc<str>>,
    /// Driver operation involved, e.g. `"send_batch"`.
    pub op: Option<&'static str>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Delay before the next attempt in milliseconds.
    pub delay_ms: Option<u32>,
    /// Number of items (or requested messages) involved.
    pub batch_size: Option<usize>,
    /// Human-readable reason (errors, overflow details...).
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            component: None,
            op: None,
            attempt: None,
            delay_ms: None,
            batch_size: None,
            reason: None,
        }
    }

    /// Attaches the emitting component.
    #[inline]
    pub fn with_component(mut self, component: impl Into<Arc<str>>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Attaches the driver operation name.
    #[inline]
    pub fn with_op(mut self, op: &'static str) -> Self {
        self.op = Some(op);
        self
    }

    /// Attaches an attempt count.
    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    /// Attaches a batch size.
    #[inline]
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = Some(n);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_component(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_component(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}
