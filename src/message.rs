//! # Portable message.
//!
//! A [`Message`] is what applications send through a [`Topic`](crate::Topic) and
//! get back from [`Subscription::receive`](crate::Subscription::receive).
//!
//! ## Completion
//! A received message must be completed exactly once:
//! ```text
//! at-least-once   ack()  ──► AckInfo { is_ack: true }  ──► ack batcher ──► send_acks
//!                 nack() ──► AckInfo { is_ack: false } ──► ack batcher ──► send_nacks
//! at-most-once    ack()  ──► driver ack_fn()
//!                 nack() ──► panic
//! ```
//! A second `ack`/`nack`, or either on a message that was never received, panics.
//! Dropping an at-least-once message without completing it logs a warning and emits
//! [`EventKind::MessageNotAcked`]; the backend redelivers it later.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::batcher::Batcher;
use crate::driver::{self, AckFn, AckId, AckInfo};
use crate::error::Error;
use crate::events::{Bus, Event, EventKind};

/// How a received message reports completion.
pub(crate) enum Completion {
    /// At-least-once: ack/nack ids go through the subscription's ack batcher.
    Batched {
        id: AckId,
        acks: Batcher<AckInfo>,
        bus: Bus,
    },
    /// At-most-once: acking runs the driver hook, nacking is a programmer error.
    AtMostOnce(AckFn),
}

enum AckState {
    /// Built by the application, not by a subscription.
    Unreceived,
    Pending(Completion),
    Done,
}

/// A message with a body, metadata and (for received messages) a completion hook.
pub struct Message {
    body: Vec<u8>,
    metadata: HashMap<Vec<u8>, Vec<u8>>,
    native: Option<Arc<dyn Any + Send + Sync>>,
    state: Mutex<AckState>,
}

impl Message {
    /// Creates a message to send.
    ///
    /// # Example
    /// ```
    /// use pubport::Message;
    ///
    /// let msg = Message::new("hello").with_metadata("lang", "en");
    /// assert_eq!(msg.body(), b"hello");
    /// assert_eq!(msg.metadata_str("lang"), Some("en"));
    /// ```
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            metadata: HashMap::new(),
            native: None,
            state: Mutex::new(AckState::Unreceived),
        }
    }

    /// Adds a metadata entry.
    ///
    /// Keys and values must be valid UTF-8 by the time the message is sent;
    /// [`Topic::send`](crate::Topic::send) rejects them otherwise.
    pub fn with_metadata(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Raw metadata.
    pub fn metadata(&self) -> &HashMap<Vec<u8>, Vec<u8>> {
        &self.metadata
    }

    /// Metadata value for `key`, if present and valid text.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key.as_bytes())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Provider-native message, if the driver attached one of type `T`.
    pub fn as_native<T: Any>(&self) -> Option<&T> {
        self.native.as_deref()?.downcast_ref::<T>()
    }

    /// Acknowledges the message.
    ///
    /// Returns immediately; for at-least-once subscriptions the ack is batched and
    /// failures surface on a later `receive` or `shutdown`.
    ///
    /// # Panics
    /// If the message was already acked or nacked, or was not received from a subscription.
    pub fn ack(&self) {
        self.complete(true);
    }

    /// Asks for redelivery of the message.
    ///
    /// # Panics
    /// If the message was already acked or nacked, was not received from a subscription,
    /// or came from an at-most-once subscription.
    pub fn nack(&self) {
        self.complete(false);
    }

    fn complete(&self, is_ack: bool) {
        let prev = std::mem::replace(&mut *self.state.lock(), AckState::Done);
        match prev {
            AckState::Unreceived => {
                panic!("pubport: ack/nack called on a message that was not received")
            }
            AckState::Done => panic!("pubport: message was already acked or nacked"),
            AckState::Pending(Completion::AtMostOnce(ack_fn)) => {
                if !is_ack {
                    panic!("pubport: nack is not supported by at-most-once subscriptions");
                }
                ack_fn();
            }
            AckState::Pending(Completion::Batched { id, acks, .. }) => {
                if let Err(err) = acks.add_no_wait(AckInfo { id, is_ack }) {
                    tracing::debug!(error = %err, is_ack, "ack dropped");
                }
            }
        }
    }

    /// Wraps a message coming out of a subscription driver.
    pub(crate) fn received(dm: driver::Message, completion: Completion) -> Self {
        let metadata = dm
            .metadata
            .into_iter()
            .map(|(k, v)| (k.into_bytes(), v.into_bytes()))
            .collect();
        Self {
            body: dm.body,
            metadata,
            native: dm.native,
            state: Mutex::new(AckState::Pending(completion)),
        }
    }

    /// Converts into the driver form, checking that all metadata is text.
    pub(crate) fn into_driver(mut self) -> Result<driver::Message, Error> {
        let mut metadata = HashMap::with_capacity(self.metadata.len());
        for (k, v) in std::mem::take(&mut self.metadata) {
            let key = String::from_utf8(k).map_err(|e| {
                Error::invalid_argument(format!(
                    "message metadata key {:?} is not valid UTF-8",
                    String::from_utf8_lossy(e.as_bytes())
                ))
            })?;
            let value = String::from_utf8(v).map_err(|_| {
                Error::invalid_argument(format!(
                    "message metadata value for key {key:?} is not valid UTF-8"
                ))
            })?;
            metadata.insert(key, value);
        }
        Ok(driver::Message {
            body: std::mem::take(&mut self.body),
            metadata,
            ack_id: None,
            native: self.native.take(),
        })
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let AckState::Pending(Completion::Batched { bus, .. }) = self.state.get_mut() {
            tracing::warn!("pubport: message dropped without ack or nack, it will be redelivered");
            bus.publish(Event::new(EventKind::MessageNotAcked).with_component("subscription"));
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            AckState::Unreceived => "unreceived",
            AckState::Pending(Completion::Batched { .. }) => "pending",
            AckState::Pending(Completion::AtMostOnce(_)) => "pending (at-most-once)",
            AckState::Done => "done",
        };
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("metadata_len", &self.metadata.len())
            .field("state", &state)
            .finish()
    }
}
