//! Adaptive size of background receives.
//!
//! The sizer measures how fast the application drains the local queue while it
//! has messages (the throughput window), and moves the running batch size towards
//! the size that would keep `desired_queue_duration` worth of messages queued.
//!
//! ```text
//! window:  start ── first arrival into an empty window (or "now" on reset with a non-empty queue)
//!          end   ── first time a receive finds the queue empty
//!          count ── messages handed out since start
//!
//! rate  = count / (end - start)
//! ideal = desired_queue_duration × rate
//! next  = running × (1 - decay) + ideal × decay, clamped to [running × shrink, running × growth]
//!         and then to [1, max_batch_size]
//! ```

use tokio::time::{Duration, Instant};

use crate::batcher::BatcherOptions;
use crate::config::ReceiveTuning;

#[derive(Debug)]
pub(crate) struct BatchSizer {
    tuning: ReceiveTuning,
    single: bool,
    running: f64,
    start: Option<Instant>,
    end: Option<Instant>,
    count: u64,
}

impl BatchSizer {
    pub(crate) fn new(tuning: ReceiveTuning, receive_batcher: &BatcherOptions) -> Self {
        Self {
            running: tuning.initial_batch_size.max(1.0),
            single: receive_batcher.is_single(),
            tuning,
            start: None,
            end: None,
            count: 0,
        }
    }

    pub(crate) fn running(&self) -> f64 {
        self.running
    }

    /// Whether a queue of `queue_len` messages is low enough to start a background receive.
    pub(crate) fn wants_prefetch(&self, queue_len: usize) -> bool {
        queue_len as f64 <= self.running * self.tuning.prefetch_ratio()
    }

    /// A message left the queue.
    pub(crate) fn record_delivery(&mut self) {
        self.count += 1;
    }

    /// A receive found the queue empty.
    pub(crate) fn record_empty(&mut self, now: Instant) {
        if self.start.is_some() && self.end.is_none() {
            self.end = Some(now);
        }
    }

    /// Messages arrived in the queue.
    pub(crate) fn record_arrival(&mut self, now: Instant) {
        if self.start.is_none() {
            self.start = Some(now);
        }
    }

    /// Updates the running estimate and returns the size of the next background receive.
    pub(crate) fn next_batch_size(&mut self, now: Instant, queue_len: usize) -> usize {
        if self.single {
            return 1;
        }
        if let Some(start) = self.start {
            let end = *self.end.get_or_insert(now);
            let mut elapsed = end.saturating_duration_since(start);
            if elapsed.is_zero() {
                elapsed = Duration::from_millis(1);
            }
            let rate = self.count as f64 / elapsed.as_secs_f64();
            let ideal = self.tuning.desired_queue_duration.as_secs_f64() * rate;

            let t = &self.tuning;
            let blended = self.running * (1.0 - t.decay) + ideal * t.decay;
            self.running = blended
                .min(self.running * t.max_growth_factor)
                .max(self.running * t.max_shrink_factor);
        }
        self.running = self
            .running
            .clamp(1.0, self.tuning.max_batch_size.max(1) as f64);

        self.start = (queue_len > 0).then_some(now);
        self.end = None;
        self.count = 0;

        self.running.ceil() as usize
    }
}
