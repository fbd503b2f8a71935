//! Error types used by the pubport runtime and its drivers.
//!
//! This module defines:
//!
//! - [`ErrorCode`]: a portable classification of failures, shared by all drivers.
//! - [`Error`]: the error returned by every [`Topic`](crate::Topic),
//!   [`Subscription`](crate::Subscription) and [`Batcher`](crate::Batcher) operation.
//! - [`BoxError`]: the error type drivers return from their calls.
//!
//! `Error` is `Clone`: one batch failure is broadcast to every caller whose item was in that
//! batch, and permanent failures are kept as sticky state and returned again later.
//!
//! Context cancellation is always reported as [`Error::Canceled`], never as a driver error,
//! so callers can tell a caller-side timeout apart from a permanent backend failure.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Error type returned by drivers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Portable error classification.
///
/// Drivers map their native errors onto these codes via
/// [`Classify::error_code`](crate::driver::Classify::error_code).
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The error could not be classified.
    Unknown,
    /// The resource was not found.
    NotFound,
    /// The resource already exists.
    AlreadyExists,
    /// The caller supplied an invalid argument.
    InvalidArgument,
    /// Something unexpected happened inside the backend.
    Internal,
    /// The operation is not supported by the backend.
    Unimplemented,
    /// The system is not in a state required for the operation.
    FailedPrecondition,
    /// The caller lacks permission.
    PermissionDenied,
    /// A quota or limit was exhausted.
    ResourceExhausted,
    /// The operation was cancelled.
    Canceled,
    /// The operation deadline passed.
    DeadlineExceeded,
}

impl ErrorCode {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Internal => "internal",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::ResourceExhausted => "resource_exhausted",
            ErrorCode::Canceled => "canceled",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// # Errors produced by the pubport runtime.
///
/// The variants map onto the failure taxonomy of the runtime:
/// - validation failures ([`Error::InvalidArgument`]) are reported before any driver call;
/// - terminal states ([`Error::TopicShutdown`], [`Error::SubscriptionShutdown`]) are sticky;
/// - cancellation ([`Error::Canceled`]) is the caller's own context ending;
/// - permanent backend failures ([`Error::Driver`]) carry the driver's classification.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The caller passed something the runtime refuses to send.
    #[error("pubport: invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// The topic has been shut down; returned by every later call.
    #[error("pubport: topic has been shut down")]
    TopicShutdown,

    /// The subscription has been shut down; returned by every later call.
    #[error("pubport: subscription has been shut down")]
    SubscriptionShutdown,

    /// An item was added to a batcher after its shutdown began.
    #[error("pubport: batcher has been shut down")]
    BatcherShutdown,

    /// The context passed to the operation (or the background context) was cancelled.
    #[error("pubport: context cancelled")]
    Canceled,

    /// A non-retryable error returned by the driver.
    #[error("pubport ({code}): {source}")]
    Driver {
        /// Classification reported by the driver.
        code: ErrorCode,
        /// The driver's native error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl Error {
    /// Wraps a driver error with the driver's classification.
    pub fn driver(code: ErrorCode, source: BoxError) -> Self {
        Error::Driver {
            code,
            source: Arc::from(source),
        }
    }

    /// Builds an [`Error::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns the portable classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Error::TopicShutdown | Error::SubscriptionShutdown | Error::BatcherShutdown => {
                ErrorCode::FailedPrecondition
            }
            Error::Canceled => ErrorCode::Canceled,
            Error::Driver { code, .. } => *code,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use pubport::Error;
    ///
    /// assert_eq!(Error::TopicShutdown.as_label(), "topic_shutdown");
    /// assert_eq!(Error::Canceled.as_label(), "canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::InvalidArgument { .. } => "invalid_argument",
            Error::TopicShutdown => "topic_shutdown",
            Error::SubscriptionShutdown => "subscription_shutdown",
            Error::BatcherShutdown => "batcher_shutdown",
            Error::Canceled => "canceled",
            Error::Driver { .. } => "driver_error",
        }
    }

    /// Indicates whether this error is a context cancellation rather than a backend failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Returns the driver's native error if it has type `E`.
    ///
    /// This is the escape hatch for reaching provider-specific error details.
    ///
    /// # Example
    /// ```
    /// use pubport::{Error, ErrorCode};
    ///
    /// let err = Error::driver(ErrorCode::NotFound, Box::new(std::io::Error::other("gone")));
    /// assert!(err.driver_error::<std::io::Error>().is_some());
    /// assert!(err.driver_error::<std::fmt::Error>().is_none());
    /// ```
    pub fn driver_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Error::Driver { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Sticky shutdown sentinels.
    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self, Error::TopicShutdown | Error::SubscriptionShutdown)
    }
}
