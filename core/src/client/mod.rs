// Client transports: consume a server stream, dispatch to handlers, reconnect
//
// Both variants share the handler registry and the connection state machine:
//
//   Idle -> Connecting -> Connected -> Disconnected -> Reconnecting -> Connecting
//                                                   \-> Closed
//
// A single driver task owns the live link and the backoff timer. `disconnect()`
// cancels that task, so no timer outlives a state transition.

mod sse;
mod socket;

pub use sse::{ByteStream, HttpSseConnector, SseClient, SseConnector, SseFrame, SseParser};
pub use socket::{SocketClient, SocketConnector, SocketLink, WsConnector};

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::EventMessage;
use crate::schema::SchemaRegistry;
use crate::{Result, TidewireError};

// ==============================================================================
// Configuration
// ==============================================================================

/// Exponential reconnect backoff: `delay * multiplier^attempt`, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(self.delay, self.multiplier, self.max_delay, attempt)
    }
}

fn backoff(base: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.min(i32::MAX as u32) as i32;
    let millis = base.as_millis() as f64 * multiplier.powi(exp);
    if !millis.is_finite() || millis < 0.0 || millis > max.as_millis() as f64 {
        max
    } else {
        Duration::from_millis(millis.round() as u64)
    }
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Validate received payloads against `schemas`
    pub validate: bool,
    pub reconnect: ReconnectConfig,
    pub schemas: SchemaRegistry,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            validate: true,
            reconnect: ReconnectConfig::default(),
            schemas: SchemaRegistry::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

// ==============================================================================
// Handlers
// ==============================================================================

pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type EventHandlerFn = Arc<dyn Fn(&EventMessage) -> HandlerResult + Send + Sync>;
type ErrorHandlerFn = Arc<dyn Fn(&TidewireError) + Send + Sync>;
type ConnectionHandlerFn = Arc<dyn Fn(bool) + Send + Sync>;

enum Slot {
    Event(String, u64),
    Any(u64),
    Error(u64),
    Connection(u64),
}

/// Returned by handler registration; call [`HandlerHandle::unsubscribe`] to remove it.
#[must_use = "dropping the handle keeps the handler registered; call unsubscribe() to remove it"]
pub struct HandlerHandle {
    handlers: Weak<Handlers>,
    slot: Slot,
}

impl HandlerHandle {
    pub fn unsubscribe(self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        match self.slot {
            Slot::Event(event, id) => {
                let mut events = handlers.events.lock();
                if let Some(list) = events.get_mut(&event) {
                    list.retain(|(hid, _)| *hid != id);
                    if list.is_empty() {
                        events.remove(&event);
                    }
                }
            }
            Slot::Any(id) => handlers.any.lock().retain(|(hid, _)| *hid != id),
            Slot::Error(id) => handlers.errors.lock().retain(|(hid, _)| *hid != id),
            Slot::Connection(id) => handlers.connection.lock().retain(|(hid, _)| *hid != id),
        }
    }
}

/// Registered callbacks of one client.
#[derive(Default)]
pub struct Handlers {
    next_id: AtomicU64,
    events: Mutex<HashMap<String, Vec<(u64, EventHandlerFn)>>>,
    any: Mutex<Vec<(u64, EventHandlerFn)>>,
    errors: Mutex<Vec<(u64, ErrorHandlerFn)>>,
    connection: Mutex<Vec<(u64, ConnectionHandlerFn)>>,
}

impl Handlers {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn handle(self: &Arc<Self>, slot: Slot) -> HandlerHandle {
        HandlerHandle {
            handlers: Arc::downgrade(self),
            slot,
        }
    }

    pub fn on<F>(self: &Arc<Self>, event: &str, handler: F) -> HandlerHandle
    where
        F: Fn(&EventMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.events
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        self.handle(Slot::Event(event.to_string(), id))
    }

    pub fn on_any<F>(self: &Arc<Self>, handler: F) -> HandlerHandle
    where
        F: Fn(&EventMessage) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.any.lock().push((id, Arc::new(handler)));
        self.handle(Slot::Any(id))
    }

    pub fn on_error<F>(self: &Arc<Self>, handler: F) -> HandlerHandle
    where
        F: Fn(&TidewireError) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.errors.lock().push((id, Arc::new(handler)));
        self.handle(Slot::Error(id))
    }

    pub fn on_connection_change<F>(self: &Arc<Self>, handler: F) -> HandlerHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.connection.lock().push((id, Arc::new(handler)));
        self.handle(Slot::Connection(id))
    }

    /// Run every matching handler; failures are isolated and reported.
    fn dispatch(&self, msg: &EventMessage) {
        // Snapshot so handlers may (un)register without deadlocking.
        let mut targets: Vec<EventHandlerFn> = self
            .events
            .lock()
            .get(&msg.event)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        targets.extend(self.any.lock().iter().map(|(_, h)| Arc::clone(h)));

        for handler in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(msg)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };
            self.emit_error(&TidewireError::Handler(format!(
                "'{}' handler failed: {}",
                msg.event, failure
            )));
        }
    }

    fn emit_error(&self, err: &TidewireError) {
        let targets: Vec<ErrorHandlerFn> =
            self.errors.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        if targets.is_empty() {
            warn!(target: "client", error = %err, "Unhandled client error");
            return;
        }
        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                warn!(target: "client", "Error handler panicked");
            }
        }
    }

    fn notify_connection(&self, connected: bool) {
        let targets: Vec<ConnectionHandlerFn> = self
            .connection
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in targets {
            if catch_unwind(AssertUnwindSafe(|| handler(connected))).is_err() {
                warn!(target: "client", "Connection handler panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Common surface of the SSE and socket clients.
pub trait ClientTransport {
    /// Start connecting. No-op while already connecting or connected.
    fn connect(&self);

    /// Intentionally close; suppresses reconnection.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn state(&self) -> ConnectionState;

    fn handlers(&self) -> &Arc<Handlers>;

    fn on<F>(&self, event: &str, handler: F) -> HandlerHandle
    where
        F: Fn(&EventMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().on(event, handler)
    }

    fn on_any<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&EventMessage) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers().on_any(handler)
    }

    fn on_error<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(&TidewireError) + Send + Sync + 'static,
    {
        self.handlers().on_error(handler)
    }

    fn on_connection_change<F>(&self, handler: F) -> HandlerHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.handlers().on_connection_change(handler)
    }
}

// ==============================================================================
// Connection state machine
// ==============================================================================

/// State shared between a client handle and its driver task.
pub(crate) struct ClientCore {
    kind: &'static str,
    config: ClientConfig,
    handlers: Arc<Handlers>,
    state: Mutex<ConnectionState>,
    attempts: AtomicU32,
    retry_hint: Mutex<Option<Duration>>,
    // Whether handlers were last told `true`. Reentrant so a handler may call
    // disconnect() from inside a notification.
    announced: ReentrantMutex<Cell<bool>>,
    driver: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ClientCore {
    pub(crate) fn new(kind: &'static str, config: ClientConfig) -> Self {
        Self {
            kind,
            config,
            handlers: Arc::new(Handlers::default()),
            state: Mutex::new(ConnectionState::Idle),
            attempts: AtomicU32::new(0),
            retry_hint: Mutex::new(None),
            announced: ReentrantMutex::new(Cell::new(false)),
            driver: Mutex::new(None),
        }
    }

    pub(crate) fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Validate and dispatch a received message.
    pub(crate) fn receive(&self, msg: EventMessage) {
        if self.config.validate {
            if let Err(e) = self.config.schemas.validate(&msg.event, &msg.data) {
                debug!(target: "client", transport = self.kind, event = %msg.event, "Payload failed validation");
                self.handlers.emit_error(&e);
                return;
            }
        }
        self.handlers.dispatch(&msg);
    }

    pub(crate) fn emit_error(&self, err: TidewireError) {
        self.handlers.emit_error(&err);
    }

    /// Server-provided base delay that replaces the configured one.
    pub(crate) fn set_retry_hint(&self, hint: Duration) {
        *self.retry_hint.lock() = Some(hint);
    }

    /// Tell handlers the link is up, if it still is once notifications are serialized.
    fn announce_connected(&self, cancel: &CancellationToken) {
        let announced = self.announced.lock();
        if announced.get() || cancel.is_cancelled() || !self.is_connected() {
            return;
        }
        announced.set(true);
        self.handlers.notify_connection(true);
    }

    /// Tell handlers the link is down. Only follows a delivered `true`.
    fn announce_disconnected(&self) {
        let announced = self.announced.lock();
        if !announced.replace(false) {
            return;
        }
        self.handlers.notify_connection(false);
    }

    /// Move to `next` unless the driver has been cancelled. Returns the previous state.
    fn transition(&self, next: ConnectionState, cancel: &CancellationToken) -> Option<ConnectionState> {
        let mut state = self.state.lock();
        if cancel.is_cancelled() {
            return None;
        }
        let previous = *state;
        *state = next;
        Some(previous)
    }

    /// Next backoff delay, or `None` when reconnection is off or exhausted.
    fn next_reconnect_delay(&self, cancel: &CancellationToken) -> Option<Duration> {
        let reconnect = &self.config.reconnect;
        if !reconnect.enabled {
            self.transition(ConnectionState::Closed, cancel);
            return None;
        }

        let attempt = self.attempts.load(Ordering::SeqCst);
        if let Some(max) = reconnect.max_attempts {
            if attempt >= max {
                if self.transition(ConnectionState::Closed, cancel).is_some() {
                    error!(target: "client", transport = self.kind, attempts = attempt, "Reconnect attempts exhausted");
                    self.emit_error(TidewireError::ReconnectExhausted { attempts: attempt });
                }
                return None;
            }
        }

        let hint = *self.retry_hint.lock();
        let base = hint.unwrap_or(reconnect.delay);
        let delay = backoff(base, reconnect.multiplier, reconnect.max_delay, attempt);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Some(delay)
    }
}

/// One concrete wire protocol driven by the shared state machine.
#[async_trait]
pub(crate) trait Transport: Send + Sync + 'static {
    type Link: Send;

    async fn open(&self) -> Result<Self::Link>;

    /// Read from the link until it drops. `Ok` means the peer closed cleanly.
    async fn pump(&self, link: Self::Link, core: &ClientCore, cancel: &CancellationToken) -> Result<()>;
}

/// Start the driver task unless one is already running.
pub(crate) fn start<T: Transport>(core: &Arc<ClientCore>, transport: &Arc<T>) {
    let mut driver = core.driver.lock();
    if let Some((_, handle)) = driver.as_ref() {
        if !handle.is_finished() {
            debug!(target: "client", transport = core.kind, "Already connecting");
            return;
        }
    }

    let cancel = CancellationToken::new();
    core.attempts.store(0, Ordering::SeqCst);
    *core.state.lock() = ConnectionState::Connecting;
    let handle = tokio::spawn(run(Arc::clone(core), Arc::clone(transport), cancel.clone()));
    *driver = Some((cancel, handle));
}

/// Cancel the driver task and settle in `Closed`.
pub(crate) fn stop(core: &ClientCore) {
    let driver = core.driver.lock().take();
    if let Some((cancel, handle)) = driver {
        cancel.cancel();
        handle.abort();
    }

    let previous = std::mem::replace(&mut *core.state.lock(), ConnectionState::Closed);
    if previous != ConnectionState::Closed {
        info!(target: "client", transport = core.kind, "Disconnected by caller");
    }
    core.announce_disconnected();
}

async fn run<T: Transport>(core: Arc<ClientCore>, transport: Arc<T>, cancel: CancellationToken) {
    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = transport.open() => opened,
        };

        match opened {
            Ok(link) => {
                if core.transition(ConnectionState::Connected, &cancel).is_none() {
                    return;
                }
                core.attempts.store(0, Ordering::SeqCst);
                info!(target: "client", transport = core.kind, "Connected");
                core.announce_connected(&cancel);

                let outcome = transport.pump(link, &core, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = outcome {
                    warn!(target: "client", transport = core.kind, error = %e, "Connection lost");
                    core.emit_error(e);
                } else {
                    warn!(target: "client", transport = core.kind, "Connection closed by server");
                }
                if core.transition(ConnectionState::Disconnected, &cancel).is_some() {
                    core.announce_disconnected();
                }
            }
            Err(e) => {
                warn!(target: "client", transport = core.kind, error = %e, "Connect failed");
                core.emit_error(e);
            }
        }

        let Some(delay) = core.next_reconnect_delay(&cancel) else {
            return;
        };
        if core.transition(ConnectionState::Reconnecting, &cancel).is_none() {
            return;
        }
        info!(
            target: "client",
            transport = core.kind,
            attempt = core.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if core.transition(ConnectionState::Connecting, &cancel).is_none() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn backoff_sequence_is_capped() {
        let cfg = ReconnectConfig::default();
        let delays: Vec<u64> = (0..8).map(|n| cfg.delay_for(n).as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn backoff_handles_huge_attempts() {
        let cfg = ReconnectConfig::default();
        assert_eq!(cfg.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let handlers = Arc::new(Handlers::default());
        let delivered = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));

        let _a = handlers.on("message", |_| Err("boom".into()));
        let _b = handlers.on("message", |_| panic!("kaboom"));
        let count = Arc::clone(&delivered);
        let _c = handlers.on("message", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let count = Arc::clone(&delivered);
        let _d = handlers.on_any(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let sink = Arc::clone(&errors);
        let _e = handlers.on_error(move |e| sink.lock().push(e.to_string()));

        handlers.dispatch(&EventMessage::new("message", json!({}), None));

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("boom"));
        assert!(errors[1].contains("kaboom"));
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let handlers = Arc::new(Handlers::default());
        let delivered = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&delivered);
        let handle = handlers.on("tick", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        handlers.dispatch(&EventMessage::new("tick", json!(1), None));
        handle.unsubscribe();
        handlers.dispatch(&EventMessage::new("tick", json!(2), None));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(handlers.events.lock().is_empty());
    }

    fn recorded_changes(core: &ClientCore) -> Arc<Mutex<Vec<bool>>> {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _handle = core.handlers.on_connection_change(move |up| sink.lock().push(up));
        changes
    }

    #[test]
    fn stop_racing_connect_announces_nothing() {
        let core = ClientCore::new("test", ClientConfig::default());
        let changes = recorded_changes(&core);
        let cancel = CancellationToken::new();

        // Driver has set Connected but not yet announced it when stop() runs
        core.transition(ConnectionState::Connected, &cancel);
        cancel.cancel();
        stop(&core);
        core.announce_connected(&cancel);

        assert_eq!(core.state(), ConnectionState::Closed);
        assert!(changes.lock().is_empty());
    }

    #[test]
    fn announcements_alternate() {
        let core = ClientCore::new("test", ClientConfig::default());
        let changes = recorded_changes(&core);
        let cancel = CancellationToken::new();

        core.transition(ConnectionState::Connected, &cancel);
        core.announce_connected(&cancel);
        core.announce_connected(&cancel);
        stop(&core);
        stop(&core);

        assert_eq!(*changes.lock(), vec![true, false]);
    }

    #[test]
    fn handler_may_disconnect_from_notification() {
        let core = Arc::new(ClientCore::new("test", ClientConfig::default()));
        let changes = recorded_changes(&core);
        let weak = Arc::downgrade(&core);
        let _h = core.handlers.on_connection_change(move |up| {
            if let (true, Some(core)) = (up, weak.upgrade()) {
                stop(&core);
            }
        });
        let cancel = CancellationToken::new();

        core.transition(ConnectionState::Connected, &cancel);
        core.announce_connected(&cancel);

        assert_eq!(core.state(), ConnectionState::Closed);
        assert_eq!(*changes.lock(), vec![true, false]);
    }
}
