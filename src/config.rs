//! # Topic and subscription configuration.
//!
//! [`TopicOptions`] and [`SubscriptionOptions`] bundle batching, retry and
//! event-bus settings; [`ReceiveTuning`] holds the constants of the adaptive
//! receive batch size estimator.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use pubport::{BackoffPolicy, BatcherOptions, SubscriptionOptions};
//!
//! let mut opts = SubscriptionOptions::default();
//! opts.receive_batcher = BatcherOptions { max_handlers: 4, max_batch_size: 500, ..Default::default() };
//! opts.retry = BackoffPolicy { first: Duration::from_millis(100), ..Default::default() };
//! opts.tuning.max_batch_size = 1000;
//!
//! assert_eq!(opts.tuning.prefetch_ratio(), 0.5);
//! ```

use std::time::Duration;

use crate::batcher::BatcherOptions;
use crate::policies::BackoffPolicy;

/// Constants of the receive batch size estimator.
///
/// The estimator aims for a local queue holding `desired_queue_duration` worth of
/// messages at the measured consumption rate, and starts a new background receive
/// once the queue drops below `prefetch_ratio()` of the current batch size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReceiveTuning {
    /// How much consumption time the local queue should hold.
    pub desired_queue_duration: Duration,
    /// Expected latency of one `receive_batch` call.
    pub expected_receive_batch_duration: Duration,
    /// Batch size used before any throughput was measured.
    pub initial_batch_size: f64,
    /// Weight of the newest estimate in the running average (`0..=1`).
    pub decay: f64,
    /// Maximum growth of the batch size per update.
    pub max_growth_factor: f64,
    /// Maximum shrinkage of the batch size per update.
    pub max_shrink_factor: f64,
    /// Upper bound of a requested batch.
    pub max_batch_size: usize,
}

impl Default for ReceiveTuning {
    /// - `desired_queue_duration = 2s`
    /// - `expected_receive_batch_duration = 1s`
    /// - `initial_batch_size = 1`
    /// - `decay = 0.5`
    /// - `max_growth_factor = 2.0`
    /// - `max_shrink_factor = 0.75`
    /// - `max_batch_size = 3000`
    fn default() -> Self {
        Self {
            desired_queue_duration: Duration::from_secs(2),
            expected_receive_batch_duration: Duration::from_secs(1),
            initial_batch_size: 1.0,
            decay: 0.5,
            max_growth_factor: 2.0,
            max_shrink_factor: 0.75,
            max_batch_size: 3000,
        }
    }
}

impl ReceiveTuning {
    /// Queue fill level (relative to the batch size) below which a prefetch starts.
    pub fn prefetch_ratio(&self) -> f64 {
        let desired = self.desired_queue_duration.as_secs_f64();
        if desired <= 0.0 {
            return 1.0;
        }
        self.expected_receive_batch_duration.as_secs_f64() / desired
    }
}

/// Configuration of a [`Topic`](crate::Topic).
#[derive(Clone, Debug)]
pub struct TopicOptions {
    /// Batching of outgoing messages.
    pub batcher: BatcherOptions,
    /// Backoff between attempts of a retryable `send_batch`.
    pub retry: BackoffPolicy,
    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
}

impl Default for TopicOptions {
    /// - `batcher = BatcherOptions::default()` (one handler, unlimited batch)
    /// - `retry = BackoffPolicy::default()`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            batcher: BatcherOptions::default(),
            retry: BackoffPolicy::default(),
            bus_capacity: 1024,
        }
    }
}

/// Configuration of a [`Subscription`](crate::Subscription).
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// How a requested receive size is split into concurrent `receive_batch` calls.
    ///
    /// `max_batch_size == 1 && max_handlers == 1` disables adaptive sizing.
    pub receive_batcher: BatcherOptions,
    /// Batching of ack/nack ids (at-least-once drivers only).
    pub ack_batcher: BatcherOptions,
    /// Backoff between attempts of retryable driver calls.
    pub retry: BackoffPolicy,
    /// Receive batch size estimator constants.
    pub tuning: ReceiveTuning,
    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            receive_batcher: BatcherOptions::default(),
            ack_batcher: BatcherOptions::default(),
            retry: BackoffPolicy::default(),
            tuning: ReceiveTuning::default(),
            bus_capacity: 1024,
        }
    }
}
