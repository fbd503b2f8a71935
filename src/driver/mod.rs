//! # Driver boundary.
//!
//! A driver adapts one message broker to the runtime. It implements
//! [`Topic`] and/or [`Subscription`]; everything else (batching, retries,
//! prefetching, ack batching, sticky errors, shutdown) lives in the portable
//! [`crate::Topic`] and [`crate::Subscription`].
//!
//! ## Contract
//! ```text
//! Classify      is_retryable(&err) -> bool
//!               error_code(&err)   -> ErrorCode           (default: Unknown)
//! Topic         send_batch(ctx, &[Message])
//!               close()
//! Subscription  receive_batch(ctx, max) -> Vec<Message>
//!               send_acks(ctx, &[AckId])
//!               send_nacks(ctx, &[AckId])                 (default: Unimplemented)
//!               ack_fn() -> Option<AckFn>                 (Some = at-most-once)
//!               close()
//! both          as_any() -> Option<&dyn Any>              (provider escape hatch)
//! ```
//!
//! ## Rules
//! - Calls may be made concurrently; implementations are `Send + Sync`.
//! - A driver never retries by itself; it reports retryable errors through
//!   [`Classify::is_retryable`] and the runtime retries with backoff.
//! - `ctx` is cancelled when the caller gives up or the owner shuts down;
//!   long-running calls should return promptly once it fires.

mod message;

pub use message::{AckFn, AckId, AckInfo, Message};

use std::any::Any;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ErrorCode};

/// Error classification shared by topic and subscription drivers.
pub trait Classify: Send + Sync + 'static {
    /// Whether `err` is transient and the call should be attempted again.
    fn is_retryable(&self, err: &BoxError) -> bool;

    /// Portable classification of `err`.
    fn error_code(&self, _err: &BoxError) -> ErrorCode {
        ErrorCode::Unknown
    }
}

/// Publishing half of a driver.
#[async_trait]
pub trait Topic: Classify {
    /// Publishes all messages. Either the whole call succeeds or it fails.
    async fn send_batch(&self, ctx: &CancellationToken, msgs: &[Message]) -> Result<(), BoxError>;

    /// Releases driver resources. Called once, by `Topic::shutdown`.
    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Exposes the provider-native handle, if any.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// Receiving half of a driver.
#[async_trait]
pub trait Subscription: Classify {
    /// Receives at most `max_messages` messages (at least one is preferred;
    /// an empty result is allowed and triggers another call).
    async fn receive_batch(
        &self,
        ctx: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<Message>, BoxError>;

    /// Acknowledges messages. Never called for at-most-once drivers.
    async fn send_acks(&self, ctx: &CancellationToken, ids: &[AckId]) -> Result<(), BoxError>;

    /// Asks for redelivery of messages.
    ///
    /// Backends without redelivery control keep the default, which fails with
    /// [`NotSupported`]; report it through [`Classify::error_code`] as
    /// [`ErrorCode::Unimplemented`].
    async fn send_nacks(&self, _ctx: &CancellationToken, _ids: &[AckId]) -> Result<(), BoxError> {
        Err(Box::new(NotSupported("send_nacks")))
    }

    /// `Some` marks an at-most-once backend: the function runs on every `Message::ack`
    /// and `send_acks` is never called.
    fn ack_fn(&self) -> Option<AckFn> {
        None
    }

    /// Releases driver resources. Called once, by `Subscription::shutdown`.
    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Exposes the provider-native handle, if any.
    fn as_any(&self) -> Option<&dyn Any> {
        None
    }
}

/// Returned by default driver methods a backend does not implement.
#[derive(Debug, thiserror::Error)]
#[error("{0} is not supported by this driver")]
pub struct NotSupported(pub &'static str);
