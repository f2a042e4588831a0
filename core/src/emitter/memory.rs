// In-memory emitter: single-process fan-out over a local subscriber set
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ServerEmitter, Subscriber};
use crate::event::{check_event_name, EventMessage, PublishOptions, SubscribeOptions};
use crate::queue::{drive, Subscription};
use crate::{Result, TidewireError};

/// Process-local emitter. Intended for single-process deployments and tests.
pub struct InMemoryEmitter {
    // Subscriber id -> subscriber
    subscribers: Arc<DashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryEmitter {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerEmitter for InMemoryEmitter {
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Subscription> {
        if self.is_closed() {
            return Err(TidewireError::EmitterClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber::new(id, opts));
        self.subscribers.insert(id, Arc::clone(&subscriber));

        // close() may have drained the set between the check above and the insert
        if self.is_closed() {
            self.subscribers.remove(&id);
            subscriber.close();
            return Err(TidewireError::EmitterClosed);
        }

        debug!(
            target: "emitter",
            subscriber_id = id,
            channel = ?subscriber.channel,
            "Created subscription"
        );

        let subscribers = Arc::clone(&self.subscribers);
        Ok(drive(subscriber, move || {
            subscribers.remove(&id);
            debug!(target: "emitter", subscriber_id = id, "Removed subscriber");
        }))
    }

    async fn publish(&self, event: &str, data: Value, opts: PublishOptions) -> Result<()> {
        if self.is_closed() {
            return Err(TidewireError::EmitterClosed);
        }
        check_event_name(event)?;

        let msg = EventMessage::new(event, data, opts.retry);
        let channel = opts.channel.as_deref();
        let mut delivered = 0usize;

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.matches(channel, &msg) && subscriber.deliver(msg.clone()) {
                delivered += 1;
            }
        }

        debug!(
            target: "emitter",
            event_id = %msg.id,
            event = %msg.event,
            channel = ?channel,
            delivered,
            "Published event"
        );
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let count = self.subscribers.len();
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
        self.subscribers.clear();

        info!(target: "emitter", subscribers = count, "In-memory emitter closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().is_live())
            .count()
    }
}
