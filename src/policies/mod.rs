//! Retry delay policies.
//!
//! Every driver call made by the runtime goes through the retry wrapper
//! ([`crate::retry`]). These types decide **how long** it waits between attempts.
//!
//! ## Contents
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization strategy to avoid synchronized retries
//!
//! ## Quick wiring
//! ```text
//! TopicOptions { retry: BackoffPolicy, .. }
//!      └─► retry::call uses retry.next(attempt) before every re-attempt
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → first=1s, factor=2.0, max=30s, jitter=Full.

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
