//! # Event subscribers.
//!
//! This module provides the [`Subscribe`] trait and the [`SubscriberSet`] fan-out
//! that delivers runtime events from a Topic/Subscription bus to user code.
//!
//! ## Architecture
//! ```text
//!   Topic / Subscription ── publish(Event) ──► Bus ──► listener
//!                                                        │
//!                                                        └──► SubscriberSet::emit(&Event)
//!                                                               ├──► [queue] ─► LogWriter
//!                                                               ├──► [queue] ─► Metrics
//!                                                               └──► [queue] ─► Custom
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use pubport::{Event, EventKind, Subscribe};
//! use async_trait::async_trait;
//!
//! struct RetryCounter;
//!
//! #[async_trait]
//! impl Subscribe for RetryCounter {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::RetryScheduled {
//!             // increment a counter
//!         }
//!     }
//!     fn name(&self) -> &'static str { "retry-counter" }
//! }
//! ```

mod hub;
#[cfg(feature = "logging")]
mod log;
mod set;
mod subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub(crate) use hub::Hub;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
