//! Messages and ack tokens as seen by drivers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::batcher::BatchItem;

/// Opaque token identifying a received message for acknowledgment.
///
/// Drivers put whatever they need in here (a delivery tag, a receipt handle...)
/// and get it back in [`Subscription::send_acks`](super::Subscription::send_acks).
#[derive(Clone)]
pub struct AckId(Arc<dyn Any + Send + Sync>);

impl AckId {
    /// Wraps a driver-specific token.
    pub fn new<T: Any + Send + Sync>(token: T) -> Self {
        Self(Arc::new(token))
    }

    /// Returns the token if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckId(..)")
    }
}

/// Unit of work for the ack batcher.
#[derive(Clone, Debug)]
pub struct AckInfo {
    /// Which message.
    pub id: AckId,
    /// `true` for ack, `false` for nack.
    pub is_ack: bool,
}

impl BatchItem for AckInfo {}

/// Ack hook of at-most-once drivers.
pub type AckFn = Arc<dyn Fn() + Send + Sync>;

/// A message crossing the driver boundary.
///
/// Metadata is always valid text here: the portable layer validates it before
/// [`Topic::send_batch`](super::Topic::send_batch) is called.
#[derive(Clone, Default)]
pub struct Message {
    /// Payload.
    pub body: Vec<u8>,
    /// Key/value attributes.
    pub metadata: HashMap<String, String>,
    /// Set by subscription drivers on received messages of at-least-once backends.
    pub ack_id: Option<AckId>,
    /// Provider-native message, exposed through `Message::as_native`.
    pub native: Option<Arc<dyn Any + Send + Sync>>,
}

impl Message {
    /// Creates a message with a body and no metadata.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Sets the ack token.
    pub fn with_ack_id(mut self, id: AckId) -> Self {
        self.ack_id = Some(id);
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("body_len", &self.body.len())
            .field("metadata", &self.metadata)
            .field("ack_id", &self.ack_id)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl BatchItem for Message {
    fn byte_size(&self) -> usize {
        self.body.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}
