//! # Retry wrapper around driver calls.
//!
//! Every driver call made by [`Topic`](crate::Topic) and
//! [`Subscription`](crate::Subscription) goes through [`call`].
//!
//! ```text
//! loop {
//!   ├─► op() ──► Ok(v)                     → return Ok(v)
//!   │      └──► Err(e)
//!   │            ├─► ctx cancelled         → Error::Canceled
//!   │            ├─► !is_retryable(e)      → Error::Driver { code: error_code(e) }
//!   │            └─► retryable
//!   │                 ├─► publish RetryScheduled
//!   │                 └─► sleep(backoff.next(attempt)) or ctx cancelled → Error::Canceled
//! }
//! ```
//!
//! ## Rules
//! - No attempt cap: retryable errors are retried until success or cancellation.
//! - The attempt counter only grows within one call.
//! - Cancellation is checked while the operation runs and during the backoff sleep.

use std::future::Future;

use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::driver::Classify;
use crate::error::{BoxError, Error};
use crate::events::{Bus, Event, EventKind};
use crate::policies::BackoffPolicy;

/// Where a retried call comes from, for events and logs.
#[derive(Clone, Copy, Debug)]
pub struct CallSite<'a> {
    /// Emitting component, e.g. `"topic"`.
    pub component: &'a str,
    /// Driver operation, e.g. `"send_batch"`.
    pub op: &'static str,
}

/// Runs `op` until it succeeds, fails permanently or `ctx` is cancelled.
///
/// # Errors
/// - [`Error::Canceled`] if `ctx` is cancelled before a result is available;
/// - [`Error::Driver`] with `classifier.error_code(..)` for a non-retryable error.
pub async fn call<T, C, F, Fut>(
    ctx: &CancellationToken,
    policy: &BackoffPolicy,
    classifier: &C,
    site: CallSite<'_>,
    bus: &Bus,
    mut op: F,
) -> Result<T, Error>
where
    C: Classify + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        let res = select! {
            biased;
            res = op() => res,
            _ = ctx.cancelled() => return Err(Error::Canceled),
        };
        let err = match res {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        if !classifier.is_retryable(&err) {
            let code = classifier.error_code(&err);
            tracing::debug!(
                component = site.component,
                op = site.op,
                code = code.as_label(),
                error = %err,
                "driver call failed permanently"
            );
            return Err(Error::driver(code, err));
        }

        let delay = policy.next(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(
            component = site.component,
            op = site.op,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying driver call"
        );
        bus.publish(
            Event::new(EventKind::RetryScheduled)
                .with_component(site.component)
                .with_op(site.op)
                .with_attempt(attempt)
                .with_delay(delay)
                .with_reason(err.to_string()),
        );

        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        select! {
            _ = &mut sleep => {}
            _ = ctx.cancelled() => return Err(Error::Canceled),
        }
    }
}
