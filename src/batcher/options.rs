//! # Batching options.
//!
//! ## Sentinel values
//! - `max_handlers = 0` → treated as 1
//! - `min_batch_size = 0` → treated as 1
//! - `max_batch_size = 0` → unlimited
//! - `max_batch_byte_size = 0` → unlimited
//! - `linger = 0s` → dispatch as soon as a handler slot is free

use std::time::Duration;

/// Limits applied by a [`Batcher`](super::Batcher).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatcherOptions {
    /// Maximum number of concurrently running handler invocations.
    pub max_handlers: usize,
    /// Minimum number of items in a batch (ignored during shutdown).
    pub min_batch_size: usize,
    /// Maximum number of items in a batch.
    pub max_batch_size: usize,
    /// Maximum summed [`BatchItem::byte_size`](super::BatchItem::byte_size) of a batch.
    pub max_batch_byte_size: usize,
    /// How long a non-full batch may wait for more items before it is dispatched.
    pub linger: Duration,
}

impl Default for BatcherOptions {
    /// One handler at a time, batches of any size, no linger.
    fn default() -> Self {
        Self {
            max_handlers: 1,
            min_batch_size: 1,
            max_batch_size: 0,
            max_batch_byte_size: 0,
            linger: Duration::ZERO,
        }
    }
}

impl BatcherOptions {
    /// Strict one-message-at-a-time semantics.
    pub fn single() -> Self {
        Self {
            max_handlers: 1,
            min_batch_size: 1,
            max_batch_size: 1,
            max_batch_byte_size: 0,
            linger: Duration::ZERO,
        }
    }

    #[inline]
    pub(crate) fn handler_limit(&self) -> usize {
        self.max_handlers.max(1)
    }

    #[inline]
    pub(crate) fn min_size(&self) -> usize {
        self.min_batch_size.max(1)
    }

    /// Whether these options force one item per call with no concurrency.
    #[inline]
    pub fn is_single(&self) -> bool {
        self.max_batch_size == 1 && self.handler_limit() == 1
    }
}

/// Splits a request for `n` items into the sizes of concurrent calls allowed by `opts`.
///
/// - `[]` if `n` is below the minimum batch size;
/// - `[n]` if batches are unlimited;
/// - otherwise at most `max_handlers` chunks of at most `max_batch_size`.
///
/// # Example
/// ```
/// use pubport::{BatcherOptions, batcher::split};
///
/// let opts = BatcherOptions { max_handlers: 2, max_batch_size: 10, ..Default::default() };
/// assert_eq!(split(25, &opts), vec![10, 10]);
/// assert_eq!(split(4, &opts), vec![4]);
/// ```
pub fn split(n: usize, opts: &BatcherOptions) -> Vec<usize> {
    let min = opts.min_size();
    if n < min {
        return Vec::new();
    }
    if opts.max_batch_size == 0 {
        return vec![n];
    }
    let mut left = n;
    let mut sizes = Vec::new();
    while left >= min && sizes.len() < opts.handler_limit() {
        let size = opts.max_batch_size.min(left);
        sizes.push(size);
        left -= size;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_below_minimum() {
        let opts = BatcherOptions {
            min_batch_size: 5,
            ..Default::default()
        };
        assert!(split(4, &opts).is_empty());
        assert_eq!(split(5, &opts), vec![5]);
    }

    #[test]
    fn test_split_unlimited() {
        assert_eq!(split(3000, &BatcherOptions::default()), vec![3000]);
    }

    #[test]
    fn test_split_respects_handler_limit() {
        let opts = BatcherOptions {
            max_handlers: 3,
            max_batch_size: 100,
            ..Default::default()
        };
        assert_eq!(split(250, &opts), vec![100, 100, 50]);
        assert_eq!(split(1000, &opts), vec![100, 100, 100]);
    }

    #[test]
    fn test_split_leftover_below_minimum_is_dropped() {
        let opts = BatcherOptions {
            max_handlers: 4,
            min_batch_size: 3,
            max_batch_size: 5,
            ..Default::default()
        };
        assert_eq!(split(12, &opts), vec![5, 5]);
    }

    #[test]
    fn test_single() {
        assert!(BatcherOptions::single().is_single());
        assert!(!BatcherOptions::default().is_single());
        let zero_handlers = BatcherOptions {
            max_handlers: 0,
            max_batch_size: 1,
            ..Default::default()
        };
        assert!(zero_handlers.is_single());
    }
}
