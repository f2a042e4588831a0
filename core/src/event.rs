// Event model: the envelope every emitter and transport carries
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{now_ms, Result, TidewireError};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a unique, roughly time-ordered event id: `<unix-ms>-<seq>`.
pub fn next_event_id() -> String {
    let seq = EVENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", now_ms(), seq)
}

/// Event names end up on a single line of the SSE framing, so CR and LF are refused.
pub fn check_event_name(event: &str) -> Result<()> {
    if event.contains(|c| c == '\r' || c == '\n') {
        return Err(TidewireError::InvalidEventName(event.to_string()));
    }
    Ok(())
}

/// A published event as seen by subscribers and clients.
///
/// Created by an emitter at publish time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    /// Event name, also the key into a [`crate::SchemaRegistry`]
    pub event: String,
    pub data: Value,
    /// Milliseconds since epoch
    pub timestamp: i64,
    /// Client reconnect hint in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: Value, retry: Option<u64>) -> Self {
        Self {
            id: next_event_id(),
            event: event.into(),
            data,
            timestamp: now_ms(),
            retry,
        }
    }

    /// Deserialize the payload into a caller-defined type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Options accepted by `publish`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Target channel; `None` publishes to the default scope
    pub channel: Option<String>,
    pub retry: Option<u64>,
}

impl PublishOptions {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }
}

/// Predicate applied to every candidate message of a subscriber.
pub type EventFilter = Arc<dyn Fn(&EventMessage) -> bool + Send + Sync>;

/// Options accepted by `subscribe`.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub channel: Option<String>,
    pub filter: Option<EventFilter>,
    /// External cancellation; cancelling ends the subscription
    pub cancel: Option<CancellationToken>,
}

impl SubscribeOptions {
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EventMessage) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("channel", &self.channel)
            .field("filter", &self.filter.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}
