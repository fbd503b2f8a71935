//! Per-owner event plumbing: one bus, and a listener feeding the subscriber set.
//!
//! Every [`Topic`](crate::Topic) and [`Subscription`](crate::Subscription) owns one
//! [`Hub`]. Without subscribers no listener task is spawned; events are still
//! published to the bus and reach anyone holding a receiver.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::Bus;
use crate::subscribers::{Subscribe, SubscriberSet};

struct Listening {
    set: Arc<SubscriberSet>,
    handle: JoinHandle<()>,
}

pub(crate) struct Hub {
    bus: Bus,
    stop: CancellationToken,
    listening: Mutex<Option<Listening>>,
}

impl Hub {
    /// Must be called from within a tokio runtime when `subscribers` is non-empty.
    pub(crate) fn new(capacity: usize, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        let bus = Bus::new(capacity);
        let stop = CancellationToken::new();
        let listening = if subscribers.is_empty() {
            None
        } else {
            let set = Arc::new(SubscriberSet::new(subscribers, bus.clone()));
            let handle = set.listen(&bus, stop.clone());
            Some(Listening { set, handle })
        };
        Self {
            bus,
            stop,
            listening: Mutex::new(listening),
        }
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Delivers what is already on the bus, then stops the listener and drains subscribers.
    pub(crate) async fn close(&self) {
        let Some(Listening { set, handle }) = self.listening.lock().take() else {
            return;
        };
        self.stop.cancel();
        if let Err(e) = handle.await {
            tracing::debug!(error = %e, "event listener ended abnormally");
        }
        match Arc::try_unwrap(set) {
            Ok(set) => set.shutdown().await,
            Err(_) => tracing::debug!("subscriber set still shared, skipping drain"),
        }
    }
}
