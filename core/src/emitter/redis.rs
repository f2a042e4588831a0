// Redis-backed emitter: horizontal fan-out across processes via Redis pub/sub
//
// Every logical channel maps to a wire channel `prefix + channel` (or
// `prefix + "default"` when no channel is given). The first local subscriber of
// a wire channel issues the network SUBSCRIBE, the last one leaving issues
// UNSUBSCRIBE. Publishes never loop back locally: local subscribers receive them
// through the same receive path as every other process.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use super::{ServerEmitter, Subscriber};
use crate::event::{check_event_name, EventMessage, PublishOptions, SubscribeOptions};
use crate::queue::{drive, Subscription};
use crate::{Result, TidewireError};

/// Wire channel used for publishes and subscribers without a channel.
pub const DEFAULT_CHANNEL: &str = "default";

/// Redis emitter configuration
#[derive(Clone, Debug)]
pub struct RedisEmitterConfig {
    pub url: String,
    /// Prepended to every logical channel name
    pub prefix: String,
}

impl Default for RedisEmitterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "events:".to_string(),
        }
    }
}

/// Network side of the emitter: a publisher and a channel-level subscriber.
///
/// Incoming messages are fed back through [`RedisEmitter::handle_message`].
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    async fn publish(&self, wire_channel: &str, payload: String) -> Result<()>;
    async fn subscribe(&self, wire_channel: &str) -> Result<()>;
    async fn unsubscribe(&self, wire_channel: &str) -> Result<()>;
}

/// `(wire_channel, payload)` pairs read from the subscriber connection.
pub type IncomingStream = Pin<Box<dyn Stream<Item = (String, String)> + Send>>;

/// [`PubSubBackend`] over two Redis connections.
pub struct RedisBackend {
    publisher: redis::aio::MultiplexedConnection,
    subscriber: Mutex<redis::aio::PubSubSink>,
}

impl RedisBackend {
    /// Open both connections; the returned stream yields `(wire_channel, payload)`.
    pub async fn connect(url: &str) -> Result<(Self, IncomingStream)> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        let (sink, stream) = client.get_async_pubsub().await?.split();

        let incoming = stream.filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some((channel, payload)),
                Err(e) => {
                    warn!(target: "redis_emitter", channel = %channel, error = %e, "Non-text payload dropped");
                    None
                }
            }
        });

        Ok((
            Self {
                publisher,
                subscriber: Mutex::new(sink),
            },
            Box::pin(incoming),
        ))
    }
}

#[async_trait]
impl PubSubBackend for RedisBackend {
    async fn publish(&self, wire_channel: &str, payload: String) -> Result<()> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(wire_channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, wire_channel: &str) -> Result<()> {
        self.subscriber.lock().await.subscribe(wire_channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, wire_channel: &str) -> Result<()> {
        self.subscriber.lock().await.unsubscribe(wire_channel).await?;
        Ok(())
    }
}

struct RedisInner {
    backend: Arc<dyn PubSubBackend>,
    prefix: String,
    // Wire channel -> (subscriber id -> subscriber). Held across the network
    // subscribe/unsubscribe so ref-count transitions are serialized.
    channels: Mutex<HashMap<String, HashMap<u64, Arc<Subscriber>>>>,
    subscriber_count: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    receiver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RedisInner {
    fn wire_channel(&self, channel: Option<&str>) -> String {
        format!("{}{}", self.prefix, channel.unwrap_or(DEFAULT_CHANNEL))
    }

    async fn remove(&self, wire_channel: &str, id: u64) {
        let mut channels = self.channels.lock().await;
        let Some(set) = channels.get_mut(wire_channel) else {
            return;
        };
        if set.remove(&id).is_some() {
            self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        }
        if set.is_empty() {
            channels.remove(wire_channel);
            if let Err(e) = self.backend.unsubscribe(wire_channel).await {
                warn!(target: "redis_emitter", channel = %wire_channel, error = %e, "Unsubscribe failed");
            } else {
                debug!(target: "redis_emitter", channel = %wire_channel, "Unsubscribed wire channel");
            }
        }
    }

    /// Close every local subscriber and release the wire channels. Runs once;
    /// later calls return immediately.
    async fn shut_down(&self, abort_receiver: bool, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let receiver = self.receiver.lock().take();
        if let Some(handle) = receiver {
            if abort_receiver {
                handle.abort();
            }
        }

        let drained: Vec<(String, HashMap<u64, Arc<Subscriber>>)> =
            self.channels.lock().await.drain().collect();
        let mut count = 0usize;
        for (wire_channel, set) in drained {
            for subscriber in set.values() {
                subscriber.close();
                count += 1;
            }
            if let Err(e) = self.backend.unsubscribe(&wire_channel).await {
                warn!(target: "redis_emitter", channel = %wire_channel, error = %e, "Unsubscribe on close failed");
            }
        }
        self.subscriber_count.store(0, Ordering::SeqCst);

        info!(target: "redis_emitter", subscribers = count, reason, "Redis emitter closed");
    }

    async fn handle_message(&self, wire_channel: &str, payload: &str) {
        let msg: EventMessage = match serde_json::from_str(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "redis_emitter", channel = %wire_channel, error = %e, "Malformed message dropped");
                return;
            }
        };

        let channels = self.channels.lock().await;
        let Some(set) = channels.get(wire_channel) else {
            return;
        };
        let mut delivered = 0usize;
        for subscriber in set.values() {
            if subscriber.accepts(&msg) && subscriber.deliver(msg.clone()) {
                delivered += 1;
            }
        }
        debug!(
            target: "redis_emitter",
            channel = %wire_channel,
            event_id = %msg.id,
            delivered,
            "Delivered incoming message"
        );
    }
}

/// Emitter that distributes events to every process subscribed to the same Redis.
#[derive(Clone)]
pub struct RedisEmitter {
    inner: Arc<RedisInner>,
}

impl RedisEmitter {
    /// Connect to Redis and start the receive loop.
    pub async fn connect(config: RedisEmitterConfig) -> Result<Self> {
        let (backend, incoming) = RedisBackend::connect(&config.url).await?;
        let emitter = Self::with_incoming(Arc::new(backend), incoming, config.prefix);
        info!(target: "redis_emitter", url = %config.url, "Redis emitter connected");
        Ok(emitter)
    }

    /// Build an emitter over `backend` that reads deliveries from `incoming`.
    ///
    /// If `incoming` ends (the subscriber connection was lost) the emitter
    /// closes: live subscriptions end, and `subscribe`/`publish` fail with
    /// [`TidewireError::EmitterClosed`].
    pub fn with_incoming<S>(
        backend: Arc<dyn PubSubBackend>,
        incoming: S,
        prefix: impl Into<String>,
    ) -> Self
    where
        S: Stream<Item = (String, String)> + Send + 'static,
    {
        let emitter = Self::with_backend(backend, prefix);
        let weak: Weak<RedisInner> = Arc::downgrade(&emitter.inner);
        let handle = tokio::spawn(async move {
            let mut incoming = Box::pin(incoming);
            while let Some((channel, payload)) = incoming.next().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_message(&channel, &payload).await,
                    None => return,
                }
            }
            if let Some(inner) = weak.upgrade() {
                if !inner.closed.load(Ordering::SeqCst) {
                    error!(target: "redis_emitter", "Subscriber connection lost, closing emitter");
                    inner.shut_down(false, "subscriber connection lost").await;
                }
            }
        });
        *emitter.inner.receiver.lock() = Some(handle);
        emitter
    }

    /// Build an emitter over any backend. The caller routes incoming messages
    /// to [`RedisEmitter::handle_message`].
    pub fn with_backend(backend: Arc<dyn PubSubBackend>, prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RedisInner {
                backend,
                prefix: prefix.into(),
                channels: Mutex::new(HashMap::new()),
                subscriber_count: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                receiver: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Deliver a raw wire message to matching local subscribers.
    ///
    /// Malformed payloads are logged and dropped.
    pub async fn handle_message(&self, wire_channel: &str, payload: &str) {
        self.inner.handle_message(wire_channel, payload).await;
    }

    pub fn wire_channel(&self, channel: Option<&str>) -> String {
        self.inner.wire_channel(channel)
    }

    /// Number of wire channels currently subscribed at the network level.
    pub async fn wire_channel_count(&self) -> usize {
        self.inner.channels.lock().await.len()
    }
}

#[async_trait]
impl ServerEmitter for RedisEmitter {
    async fn subscribe(&self, opts: SubscribeOptions) -> Result<Subscription> {
        if self.is_closed() {
            return Err(TidewireError::EmitterClosed);
        }

        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber::new(id, opts));
        let wire_channel = inner.wire_channel(subscriber.channel.as_deref());

        {
            let mut channels = inner.channels.lock().await;
            if inner.closed.load(Ordering::SeqCst) {
                return Err(TidewireError::EmitterClosed);
            }
            if !channels.contains_key(&wire_channel) {
                inner.backend.subscribe(&wire_channel).await.map_err(|e| {
                    error!(target: "redis_emitter", channel = %wire_channel, error = %e, "Subscribe failed");
                    e
                })?;
                debug!(target: "redis_emitter", channel = %wire_channel, "Subscribed wire channel");
            }
            channels
                .entry(wire_channel.clone())
                .or_default()
                .insert(id, Arc::clone(&subscriber));
            inner.subscriber_count.fetch_add(1, Ordering::SeqCst);
        }

        debug!(
            target: "redis_emitter",
            subscriber_id = id,
            channel = %wire_channel,
            "Created subscription"
        );

        let weak = Arc::downgrade(&self.inner);
        Ok(drive(subscriber, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { inner.remove(&wire_channel, id).await });
                }
                Err(_) => {
                    warn!(target: "redis_emitter", subscriber_id = id, "No runtime to remove subscriber");
                }
            }
        }))
    }

    async fn publish(&self, event: &str, data: Value, opts: PublishOptions) -> Result<()> {
        if self.is_closed() {
            return Err(TidewireError::EmitterClosed);
        }
        check_event_name(event)?;

        let msg = EventMessage::new(event, data, opts.retry);
        let wire_channel = self.inner.wire_channel(opts.channel.as_deref());
        let payload = serde_json::to_string(&msg)?;

        self.inner
            .backend
            .publish(&wire_channel, payload)
            .await
            .map_err(|e| {
                warn!(target: "redis_emitter", channel = %wire_channel, error = %e, "Publish failed");
                e
            })?;

        debug!(
            target: "redis_emitter",
            event_id = %msg.id,
            event = %msg.event,
            channel = %wire_channel,
            "Published event"
        );
        Ok(())
    }

    async fn close(&self) {
        self.inner.shut_down(true, "closed").await;
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn subscriber_count(&self) -> usize {
        self.inner.subscriber_count.load(Ordering::SeqCst)
    }
}
