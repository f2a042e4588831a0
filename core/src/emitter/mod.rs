// Emitters: publish/subscribe brokers fanning events out to subscribers
//
// Two implementations share one contract:
// - InMemoryEmitter: process-local subscriber set
// - RedisEmitter: cross-process fan-out over Redis pub/sub

mod memory;
mod redis;

pub use self::memory::InMemoryEmitter;
pub use self::redis::{
    IncomingStream, PubSubBackend, RedisBackend, RedisEmitter, RedisEmitterConfig,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::event::{EventFilter, EventMessage, PublishOptions, SubscribeOptions};
use crate::queue::{Mailbox, Subscription};
use crate::Result;

/// Publish/subscribe broker consumed by domain collaborators and transports.
#[async_trait]
pub trait ServerEmitter: Send + Sync {
    /// Register a new subscriber and return its message sequence.
    ///
    /// Fails with [`crate::TidewireError::EmitterClosed`] after `close()`.
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Subscription>;

    /// Wrap `data` into an [`EventMessage`] and fan it out.
    ///
    /// Payloads are not validated here; callers validate before publishing.
    async fn publish(&self, event: &str, data: Value, opts: PublishOptions) -> Result<()>;

    /// Terminate every live subscription. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Number of live local subscribers.
    fn subscriber_count(&self) -> usize;
}

/// Emitter-owned record of one `subscribe()` call.
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) channel: Option<String>,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) mailbox: Mailbox,
    pub(crate) cancel: CancellationToken,
}

impl Subscriber {
    pub(crate) fn new(id: u64, opts: SubscribeOptions) -> Self {
        Self {
            id,
            channel: opts.channel,
            filter: opts.filter,
            mailbox: Mailbox::new(),
            cancel: opts.cancel.unwrap_or_else(CancellationToken::new),
        }
    }

    /// Channel rule: an unbound subscriber matches any publish, a bound one only its channel.
    pub(crate) fn matches_channel(&self, channel: Option<&str>) -> bool {
        match self.channel.as_deref() {
            None => true,
            Some(bound) => Some(bound) == channel,
        }
    }

    pub(crate) fn accepts(&self, msg: &EventMessage) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(msg))
    }

    pub(crate) fn matches(&self, channel: Option<&str>, msg: &EventMessage) -> bool {
        self.matches_channel(channel) && self.accepts(msg)
    }

    /// Queue `msg` unless the subscriber is cancelled or closed.
    pub(crate) fn deliver(&self, msg: EventMessage) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.mailbox.push(msg)
    }

    pub(crate) fn close(&self) {
        self.mailbox.close();
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.mailbox.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_matching_rule() {
        let unbound = Subscriber::new(1, SubscribeOptions::default());
        let bound = Subscriber::new(2, SubscribeOptions::channel("room-1"));
        let msg = EventMessage::new("message", json!({}), None);

        assert!(unbound.matches(None, &msg));
        assert!(unbound.matches(Some("room-2"), &msg));
        assert!(bound.matches(Some("room-1"), &msg));
        assert!(!bound.matches(Some("room-2"), &msg));
        assert!(!bound.matches(None, &msg));
    }

    #[test]
    fn filter_is_anded_with_channel() {
        let sub = Subscriber::new(
            1,
            SubscribeOptions::channel("room-1").with_filter(|m| m.event == "message"),
        );
        let message = EventMessage::new("message", json!({}), None);
        let typing = EventMessage::new("typing", json!({}), None);

        assert!(sub.matches(Some("room-1"), &message));
        assert!(!sub.matches(Some("room-1"), &typing));
        assert!(!sub.matches(Some("room-2"), &message));
    }

    #[test]
    fn cancelled_subscriber_refuses_delivery() {
        let cancel = CancellationToken::new();
        let sub = Subscriber::new(1, SubscribeOptions::default().with_cancel(cancel.clone()));
        assert!(sub.deliver(EventMessage::new("a", json!(1), None)));
        cancel.cancel();
        assert!(!sub.is_live());
        assert!(!sub.deliver(EventMessage::new("a", json!(2), None)));
    }
}
