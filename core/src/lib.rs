// Tidewire Core Library
// Real-time event distribution: emitters, streaming transports, reconnecting clients

pub mod client;
pub mod config;
pub mod emitter;
pub mod event;
pub mod queue;
pub mod schema;
pub mod transport;

// Export core types
pub use client::{
    ClientConfig, ClientTransport, ConnectionState, HandlerHandle, ReconnectConfig, SocketClient,
    SseClient,
};
pub use config::TidewireConfig;
pub use emitter::{
    InMemoryEmitter, PubSubBackend, RedisEmitter, RedisEmitterConfig, ServerEmitter,
};
pub use event::{EventMessage, PublishOptions, SubscribeOptions};
pub use queue::Subscription;
pub use schema::{SchemaRegistry, ValidationIssue, Validator};
pub use transport::socket::{
    ConnectionId, ConnectionManager, SocketFrame, SocketOptions, SocketServer,
};
pub use transport::sse::{SseOptions, SseResponse};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidewireError {
    #[error("Validation failed for event '{event}': {}", schema::describe_issues(.issues))]
    Validation {
        event: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Invalid event name {0:?}: line breaks are not allowed")]
    InvalidEventName(String),

    #[error("Emitter closed")]
    EmitterClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler error: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, TidewireError>;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
