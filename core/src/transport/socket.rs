// Bidirectional socket transport
//
// Wraps a raw duplex connection with JSON framing and ping/pong liveness.
// The raw socket is abstracted as an inbound stream of text frames plus a
// `SocketSession` the adapter drains for outbound frames, so any websocket
// library (or an in-memory pipe in tests) can sit underneath.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, Interval, Sleep};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emitter::ServerEmitter;
use crate::event::{EventMessage, SubscribeOptions};
use crate::queue::Subscription;
use crate::{now_ms, Result, TidewireError};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(30_000);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_OUTBOUND_CAPACITY: usize = 512;
// Event ids remembered per connection to drop duplicates from overlapping subscriptions
const RECENT_EVENT_WINDOW: usize = 256;

// ==============================================================================
// Wire format
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Event,
    Ping,
    Pong,
    Subscribe,
    Error,
}

/// JSON envelope `{type, payload?, timestamp}` exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: i64,
}

/// Decoded frame with a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    Event(EventMessage),
    Ping,
    Pong,
    Subscribe { channel: String },
    Error { message: String },
}

impl SocketFrame {
    fn new(kind: FrameKind, payload: Option<Value>) -> Self {
        Self {
            kind,
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn event(msg: &EventMessage) -> Result<Self> {
        Ok(Self::new(FrameKind::Event, Some(serde_json::to_value(msg)?)))
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, None)
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, None)
    }

    pub fn subscribe(channel: &str) -> Self {
        Self::new(FrameKind::Subscribe, Some(json!({ "channel": channel })))
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self::new(
            FrameKind::Error,
            Some(json!({ "message": message.to_string() })),
        )
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| TidewireError::Transport(format!("malformed frame: {}", e)))
    }

    /// Interpret the payload according to the frame type.
    pub fn into_message(self) -> Result<SocketMessage> {
        #[derive(Deserialize)]
        struct ChannelPayload {
            channel: String,
        }
        #[derive(Deserialize)]
        struct ErrorPayload {
            message: String,
        }

        let payload = self.payload.unwrap_or(Value::Null);
        let message = match self.kind {
            FrameKind::Event => SocketMessage::Event(serde_json::from_value(payload)?),
            FrameKind::Ping => SocketMessage::Ping,
            FrameKind::Pong => SocketMessage::Pong,
            FrameKind::Subscribe => {
                let p: ChannelPayload = serde_json::from_value(payload)?;
                SocketMessage::Subscribe { channel: p.channel }
            }
            FrameKind::Error => {
                let p: ErrorPayload = serde_json::from_value(payload)?;
                SocketMessage::Error { message: p.message }
            }
        };
        Ok(message)
    }
}

/// Decode a text frame straight into a typed message.
pub fn parse_message(text: &str) -> Result<SocketMessage> {
    SocketFrame::decode(text)?.into_message()
}

// ==============================================================================
// Connections
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Server-side handle of one live socket.
pub struct SocketConnection {
    id: ConnectionId,
    remote: Option<String>,
    outbound: mpsc::Sender<String>,
    channels: Mutex<HashSet<String>>,
    recent: Mutex<VecDeque<String>>,
    cancel: CancellationToken,
}

impl SocketConnection {
    fn new(id: ConnectionId, remote: Option<String>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id,
            remote,
            outbound,
            channels: Mutex::new(HashSet::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENT_WINDOW)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Queue a frame for the client. Returns whether delivery was attempted,
    /// not whether the client received it.
    pub fn send(&self, frame: &SocketFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "socket", connection_id = %self.id, error = %e, "Failed to encode frame");
                return false;
            }
        };
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "socket", connection_id = %self.id, "Outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an event frame. An event already sent on this connection (reached
    /// through a second subscription) is skipped.
    pub fn send_event(&self, msg: &EventMessage) -> bool {
        {
            let mut recent = self.recent.lock();
            if recent.iter().any(|id| *id == msg.id) {
                return false;
            }
            if recent.len() == RECENT_EVENT_WINDOW {
                recent.pop_front();
            }
            recent.push_back(msg.id.clone());
        }
        match SocketFrame::event(msg) {
            Ok(frame) => self.send(&frame),
            Err(e) => {
                warn!(target: "socket", connection_id = %self.id, error = %e, "Failed to frame event");
                false
            }
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            debug!(target: "socket", connection_id = %self.id, "Connection closing");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.lock().contains(channel)
    }
}

impl fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Adapter side of an accepted connection: drain this into the raw socket.
pub struct SocketSession {
    pub connection: Arc<SocketConnection>,
    outbound: mpsc::Receiver<String>,
}

impl SocketSession {
    /// Next text frame to write. Queued frames are flushed before `None`
    /// signals that the raw socket should be closed.
    pub async fn next_outbound(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            Some(text) = self.outbound.recv() => Some(text),
            _ = self.connection.cancel.cancelled() => None,
        }
    }
}

// ==============================================================================
// Connection manager
// ==============================================================================

/// Live connections plus a channel -> connection index for targeted broadcast.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<SocketConnection>>,
    channels: DashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<SocketConnection>) {
        self.connections.insert(connection.id, connection);
    }

    /// Remove a connection and every channel index entry it belonged to.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<SocketConnection>> {
        let (_, connection) = self.connections.remove(&id)?;
        let joined: Vec<String> = connection.channels.lock().drain().collect();
        for channel in joined {
            self.unindex(&channel, id);
        }
        Some(connection)
    }

    /// Add a connection to a channel. Returns false if unknown or already a member.
    pub fn join(&self, id: ConnectionId, channel: &str) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };
        if !connection.channels.lock().insert(channel.to_string()) {
            return false;
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        true
    }

    pub fn leave(&self, id: ConnectionId, channel: &str) {
        if let Some(connection) = self.get(id) {
            connection.channels.lock().remove(channel);
        }
        self.unindex(channel, id);
    }

    fn unindex(&self, channel: &str, id: ConnectionId) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(&id);
        }
        self.channels
            .remove_if(channel, |_, members| members.is_empty());
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<SocketConnection>> {
        self.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    /// Send to every live connection; returns how many sends were attempted.
    pub fn broadcast(&self, frame: &SocketFrame) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().send(frame))
            .count()
    }

    pub fn broadcast_to_channel(&self, channel: &str, frame: &SocketFrame) -> usize {
        self.channel_members(channel)
            .into_iter()
            .filter(|id| self.send_to(*id, frame))
            .count()
    }

    /// Returns whether delivery was attempted, not whether it was received.
    pub fn send_to(&self, id: ConnectionId, frame: &SocketFrame) -> bool {
        self.get(id).map_or(false, |connection| connection.send(frame))
    }

    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some(connection) = self.remove(id) {
                connection.close();
            }
        }
        info!(target: "socket", "All connections closed");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn channel_members(&self, channel: &str) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .channels
            .get(channel)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

// ==============================================================================
// Server
// ==============================================================================

/// Socket server options
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// `Duration::ZERO` disables server pings and the pong deadline
    pub ping_interval: Duration,
    /// How long after a ping the server waits for a pong before closing
    pub pong_timeout: Duration,
    pub outbound_capacity: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Receives `event` frames sent by clients.
#[async_trait]
pub trait ClientEventHandler: Send + Sync {
    async fn on_client_event(&self, connection: &SocketConnection, msg: EventMessage)
        -> Result<()>;
}

/// Accepts raw socket connections and serves emitter events over them.
pub struct SocketServer {
    emitter: Arc<dyn ServerEmitter>,
    manager: Arc<ConnectionManager>,
    options: SocketOptions,
    client_events: Option<Arc<dyn ClientEventHandler>>,
    next_id: AtomicU64,
}

impl SocketServer {
    pub fn new(emitter: Arc<dyn ServerEmitter>, options: SocketOptions) -> Self {
        Self {
            emitter,
            manager: Arc::new(ConnectionManager::new()),
            options,
            client_events: None,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_client_event_handler(mut self, handler: Arc<dyn ClientEventHandler>) -> Self {
        self.client_events = Some(handler);
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Register a new connection and start serving it.
    ///
    /// `inbound` yields text frames read from the raw socket and ends when the
    /// client goes away. The connection is subscribed to `channel` (or the
    /// default scope) immediately.
    pub async fn accept<S>(
        &self,
        inbound: S,
        channel: Option<String>,
        remote: Option<String>,
    ) -> Result<SocketSession>
    where
        S: Stream<Item = String> + Send + Unpin + 'static,
    {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.options.outbound_capacity.max(1));
        let connection = Arc::new(SocketConnection::new(id, remote, tx));

        let subscription = self
            .emitter
            .subscribe(SubscribeOptions {
                channel: channel.clone(),
                filter: None,
                cancel: Some(connection.cancel.child_token()),
            })
            .await?;

        self.manager.add(Arc::clone(&connection));
        if let Some(channel) = channel.as_deref() {
            self.manager.join(id, channel);
        }
        spawn_forwarder(Arc::clone(&connection), subscription, true);

        info!(
            target: "socket",
            connection_id = %id,
            remote = ?connection.remote,
            channel = ?channel,
            "Connection accepted"
        );

        let ctx = ConnectionContext {
            connection: Arc::clone(&connection),
            emitter: Arc::clone(&self.emitter),
            manager: Arc::clone(&self.manager),
            client_events: self.client_events.clone(),
            options: self.options.clone(),
        };
        tokio::spawn(ctx.run(inbound));

        Ok(SocketSession {
            connection,
            outbound: rx,
        })
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        self.manager.close_all();
    }
}

/// Pump subscription messages into the connection. With `owns_connection` the
/// connection is closed once the subscription ends.
fn spawn_forwarder(
    connection: Arc<SocketConnection>,
    mut subscription: Subscription,
    owns_connection: bool,
) {
    tokio::spawn(async move {
        while let Some(msg) = subscription.next().await {
            if connection.is_closed() {
                break;
            }
            connection.send_event(&msg);
        }
        debug!(
            target: "socket",
            connection_id = %connection.id,
            subscription_id = subscription.id(),
            "Forwarder stopped"
        );
        if owns_connection && !connection.is_closed() {
            info!(target: "socket", connection_id = %connection.id, "Subscription ended, closing connection");
            connection.close();
        }
    });
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(ping) => {
            ping.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn pong_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

enum Step {
    Closed,
    PongTimeout,
    Ping,
    Frame(String),
    Disconnected,
}

struct ConnectionContext {
    connection: Arc<SocketConnection>,
    emitter: Arc<dyn ServerEmitter>,
    manager: Arc<ConnectionManager>,
    client_events: Option<Arc<dyn ClientEventHandler>>,
    options: SocketOptions,
}

impl ConnectionContext {
    /// Liveness state machine plus inbound frame handling for one connection.
    async fn run<S>(self, mut inbound: S)
    where
        S: Stream<Item = String> + Send + Unpin + 'static,
    {
        let id = self.connection.id;
        let ping_every = self.options.ping_interval;
        let mut ping = if ping_every.is_zero() {
            None
        } else {
            Some(interval_at(Instant::now() + ping_every, ping_every))
        };
        let mut deadline: Option<Pin<Box<Sleep>>> = None;

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = self.connection.cancel.cancelled() => Step::Closed,
                _ = pong_deadline(&mut deadline) => Step::PongTimeout,
                _ = next_ping(&mut ping) => Step::Ping,
                frame = inbound.next() => match frame {
                    Some(text) => Step::Frame(text),
                    None => Step::Disconnected,
                },
            };
            match step {
                Step::Closed => break "closed",
                Step::PongTimeout => {
                    warn!(target: "socket", connection_id = %id, "Pong timeout, closing connection");
                    break "pong timeout";
                }
                Step::Ping => {
                    self.connection.send(&SocketFrame::ping());
                    if deadline.is_none() {
                        deadline = Some(Box::pin(sleep(self.options.pong_timeout)));
                    }
                }
                Step::Frame(text) => {
                    if self.handle_frame(&text).await {
                        deadline = None;
                    }
                }
                Step::Disconnected => break "client disconnected",
            }
        };

        self.connection.close();
        self.manager.remove(id);
        info!(target: "socket", connection_id = %id, reason, "Connection closed");
    }

    /// Returns true when the frame was a pong.
    async fn handle_frame(&self, text: &str) -> bool {
        let id = self.connection.id;
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "socket", connection_id = %id, error = %e, "Ignored frame");
                return false;
            }
        };

        match message {
            SocketMessage::Pong => return true,
            SocketMessage::Ping => {
                self.connection.send(&SocketFrame::pong());
            }
            SocketMessage::Subscribe { channel } => self.join_channel(channel).await,
            SocketMessage::Event(msg) => match &self.client_events {
                Some(handler) => {
                    if let Err(e) = handler.on_client_event(&self.connection, msg).await {
                        self.connection.send(&SocketFrame::error(&e));
                    }
                }
                None => {
                    debug!(target: "socket", connection_id = %id, event = %msg.event, "Client event dropped, no handler");
                }
            },
            SocketMessage::Error { message } => {
                warn!(target: "socket", connection_id = %id, message = %message, "Client reported error");
            }
        }
        false
    }

    async fn join_channel(&self, channel: String) {
        let id = self.connection.id;
        if self.connection.in_channel(&channel) {
            return;
        }
        let opts = SubscribeOptions {
            channel: Some(channel.clone()),
            filter: None,
            cancel: Some(self.connection.cancel.child_token()),
        };
        match self.emitter.subscribe(opts).await {
            Ok(subscription) => {
                self.manager.join(id, &channel);
                spawn_forwarder(Arc::clone(&self.connection), subscription, false);
                debug!(target: "socket", connection_id = %id, channel = %channel, "Joined channel");
            }
            Err(e) => {
                warn!(target: "socket", connection_id = %id, channel = %channel, error = %e, "Channel subscribe failed");
                self.connection.send(&SocketFrame::error(&e));
            }
        }
    }
}
