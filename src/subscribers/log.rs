//! # LogWriter: renders runtime events through `tracing`
//!
//! A minimal subscriber for demos and debugging. Install a `tracing` subscriber in
//! the application to see the output.
//!
//! ## Example output
//! ```text
//! DEBUG batch dispatched component="topic" op="send_batch" size=12
//!  WARN retry scheduled component="subscription" op="receive_batch" attempt=1 delay_ms=740 reason="unavailable"
//!  WARN ack error stored component="subscription" reason="permission denied"
//!  INFO topic shut down component="topic"
//! ```

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;
use async_trait::async_trait;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let component = e.component.as_deref().unwrap_or("-");
        let op = e.op.unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::BatchDispatched => {
                tracing::debug!(component, op, size = ?e.batch_size, "batch dispatched");
            }
            EventKind::BatchFailed => {
                tracing::warn!(component, op, size = ?e.batch_size, reason, "batch failed");
            }
            EventKind::RetryScheduled => {
                tracing::warn!(
                    component,
                    op,
                    attempt = ?e.attempt,
                    delay_ms = ?e.delay_ms,
                    reason,
                    "retry scheduled"
                );
            }
            EventKind::BatchSizeUpdated => {
                tracing::trace!(component, size = ?e.batch_size, "receive batch size updated");
            }
            EventKind::AckErrorStored => {
                tracing::warn!(component, reason, "ack error stored");
            }
            EventKind::MessageNotAcked => {
                tracing::warn!(component, "message dropped without ack or nack");
            }
            EventKind::TopicShutdown => {
                tracing::info!(component, reason, "topic shut down");
            }
            EventKind::SubscriptionShutdown => {
                tracing::info!(component, reason, "subscription shut down");
            }
            EventKind::SubscriberOverflow => {
                tracing::warn!(subscriber = component, reason, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                tracing::error!(subscriber = component, reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
