//! # In-memory driver.
//!
//! A process-local broker for local development and tests. Open the
//! subscriptions of a topic before publishing: a message is copied to every
//! subscription that exists when it is sent.
//!
//! ```text
//! MemTopic::send_batch ──► assign ids ──► copy into every open MemSubscription
//!
//! MemSubscription (at-least-once)
//!   receive_batch ──► deliverable messages (never delivered, nacked, or past their deadline)
//!                      └─► deadline = now + ack_deadline
//!   send_acks     ──► remove
//!   send_nacks    ──► deliverable again right away
//!
//! MemSubscription (at-most-once)
//!   receive_batch ──► remove on delivery; ack_fn is a no-op
//! ```
//!
//! Nothing here is retryable; all errors are permanent.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::driver::{self, AckFn, AckId, Classify};
use crate::error::{BoxError, ErrorCode};

/// Upper bound of messages returned by one `receive_batch`.
const MAX_BATCH: usize = 100;

/// Errors of the in-memory driver.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("mem: topic is closed")]
    TopicClosed,
    #[error("mem: subscription is closed")]
    SubscriptionClosed,
    #[error("mem: ack id was not issued by this driver")]
    ForeignAckId,
    #[error("mem: context cancelled")]
    Canceled,
}

fn classify(err: &BoxError) -> ErrorCode {
    match err.downcast_ref::<MemError>() {
        Some(MemError::TopicClosed | MemError::SubscriptionClosed) => ErrorCode::FailedPrecondition,
        Some(MemError::ForeignAckId) => ErrorCode::InvalidArgument,
        Some(MemError::Canceled) => ErrorCode::Canceled,
        None => ErrorCode::Unknown,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct MemAckId(u64);

struct TopicState {
    subs: Vec<Arc<SubShared>>,
    next_id: u64,
    closed: bool,
}

/// In-memory topic. Clones refer to the same topic.
#[derive(Clone)]
pub struct MemTopic {
    state: Arc<Mutex<TopicState>>,
}

impl Default for MemTopic {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTopic {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TopicState {
                subs: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    fn attach(&self, sub: Arc<SubShared>) {
        self.state.lock().subs.push(sub);
    }
}

impl Classify for MemTopic {
    fn is_retryable(&self, _err: &BoxError) -> bool {
        false
    }

    fn error_code(&self, err: &BoxError) -> ErrorCode {
        classify(err)
    }
}

#[async_trait]
impl driver::Topic for MemTopic {
    async fn send_batch(
        &self,
        ctx: &CancellationToken,
        msgs: &[driver::Message],
    ) -> Result<(), BoxError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(Box::new(MemError::TopicClosed));
        }
        if ctx.is_cancelled() {
            return Err(Box::new(MemError::Canceled));
        }
        let first = st.next_id;
        st.next_id += msgs.len() as u64;
        st.subs.retain(|s| !s.closed.is_cancelled());
        for sub in &st.subs {
            sub.add(first, msgs);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}

struct Pending {
    msg: driver::Message,
    /// `None` means deliverable now.
    deadline: Option<Instant>,
}

struct SubShared {
    /// `None` for at-most-once.
    ack_deadline: Option<Duration>,
    msgs: Mutex<BTreeMap<MemAckId, Pending>>,
    arrived: Notify,
    closed: CancellationToken,
}

impl SubShared {
    fn add(&self, first: u64, msgs: &[driver::Message]) {
        {
            let mut map = self.msgs.lock();
            for (i, m) in msgs.iter().enumerate() {
                let mut msg = m.clone();
                msg.ack_id = None;
                map.insert(
                    MemAckId(first + i as u64),
                    Pending {
                        msg,
                        deadline: None,
                    },
                );
            }
        }
        self.arrived.notify_waiters();
    }

    /// Takes up to `max` deliverable messages; otherwise reports the next deadline.
    fn take(&self, now: Instant, max: usize) -> (Vec<driver::Message>, Option<Instant>) {
        let mut map = self.msgs.lock();
        let mut out = Vec::new();
        let mut next_deadline: Option<Instant> = None;
        let mut delivered_once = Vec::new();

        for (id, p) in map.iter_mut() {
            if out.len() >= max {
                break;
            }
            match p.deadline {
                Some(d) if d > now => {
                    next_deadline = Some(next_deadline.map_or(d, |n| n.min(d)));
                }
                _ => {
                    let mut msg = p.msg.clone();
                    match self.ack_deadline {
                        Some(deadline) => {
                            msg.ack_id = Some(AckId::new(*id));
                            p.deadline = Some(now + deadline);
                        }
                        None => delivered_once.push(*id),
                    }
                    out.push(msg);
                }
            }
        }
        for id in delivered_once {
            map.remove(&id);
        }
        (out, next_deadline)
    }

    fn ids(ids: &[AckId]) -> Result<Vec<MemAckId>, BoxError> {
        ids.iter()
            .map(|id| {
                id.downcast_ref::<MemAckId>()
                    .copied()
                    .ok_or_else(|| Box::new(MemError::ForeignAckId) as BoxError)
            })
            .collect()
    }

    fn check_open(&self, ctx: &CancellationToken) -> Result<(), BoxError> {
        if self.closed.is_cancelled() {
            return Err(Box::new(MemError::SubscriptionClosed));
        }
        if ctx.is_cancelled() {
            return Err(Box::new(MemError::Canceled));
        }
        Ok(())
    }
}

/// In-memory subscription to a [`MemTopic`].
pub struct MemSubscription {
    shared: Arc<SubShared>,
}

impl MemSubscription {
    /// At-least-once subscription: unacked messages are redelivered after `ack_deadline`.
    pub fn new(topic: &MemTopic, ack_deadline: Duration) -> Self {
        Self::attach(topic, Some(ack_deadline))
    }

    /// At-most-once subscription: messages are gone once delivered.
    pub fn at_most_once(topic: &MemTopic) -> Self {
        Self::attach(topic, None)
    }

    fn attach(topic: &MemTopic, ack_deadline: Option<Duration>) -> Self {
        let shared = Arc::new(SubShared {
            ack_deadline,
            msgs: Mutex::new(BTreeMap::new()),
            arrived: Notify::new(),
            closed: CancellationToken::new(),
        });
        topic.attach(Arc::clone(&shared));
        Self { shared }
    }

    /// Number of messages not yet acknowledged (or, at-most-once, not yet delivered).
    pub fn outstanding(&self) -> usize {
        self.shared.msgs.lock().len()
    }
}

impl Classify for MemSubscription {
    fn is_retryable(&self, _err: &BoxError) -> bool {
        false
    }

    fn error_code(&self, err: &BoxError) -> ErrorCode {
        classify(err)
    }
}

#[async_trait]
impl driver::Subscription for MemSubscription {
    async fn receive_batch(
        &self,
        ctx: &CancellationToken,
        max_messages: usize,
    ) -> Result<Vec<driver::Message>, BoxError> {
        let s = &self.shared;
        let max = max_messages.clamp(1, MAX_BATCH);
        loop {
            s.check_open(ctx)?;
            let arrived = s.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (msgs, next_deadline) = s.take(Instant::now(), max);
            if !msgs.is_empty() {
                return Ok(msgs);
            }
            let redelivery = async {
                match next_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = &mut arrived => {}
                _ = redelivery => {}
                _ = ctx.cancelled() => return Err(Box::new(MemError::Canceled)),
                _ = s.closed.cancelled() => return Err(Box::new(MemError::SubscriptionClosed)),
            }
        }
    }

    async fn send_acks(&self, ctx: &CancellationToken, ids: &[AckId]) -> Result<(), BoxError> {
        let s = &self.shared;
        s.check_open(ctx)?;
        let ids = SubShared::ids(ids)?;
        let mut map = s.msgs.lock();
        for id in ids {
            // Already acked is fine: a redelivered copy may have been acked first.
            map.remove(&id);
        }
        Ok(())
    }

    async fn send_nacks(&self, ctx: &CancellationToken, ids: &[AckId]) -> Result<(), BoxError> {
        let s = &self.shared;
        s.check_open(ctx)?;
        let ids = SubShared::ids(ids)?;
        {
            let mut map = s.msgs.lock();
            for id in ids {
                if let Some(p) = map.get_mut(&id) {
                    p.deadline = None;
                }
            }
        }
        s.arrived.notify_waiters();
        Ok(())
    }

    fn ack_fn(&self) -> Option<AckFn> {
        match self.shared.ack_deadline {
            Some(_) => None,
            None => Some(Arc::new(|| {})),
        }
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.shared.closed.cancel();
        Ok(())
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}
