//! Runtime events: types and broadcast bus.
//!
//! Topics, subscriptions, batchers and the retry wrapper report what they do as
//! [`Event`]s on a [`Bus`]. A Topic/Subscription built with subscribers fans the
//! events out to them through a [`SubscriberSet`](crate::SubscriberSet).
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
