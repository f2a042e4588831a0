use std::fs;
use std::path::Path;
use std::time::Duration;

use tidewire_core::TidewireConfig;

/// Which emitter the relay fans events out through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Relay server configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub tidewire: TidewireConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            backend: std::env::var("RELAY_BACKEND")
                .ok()
                .and_then(|b| Backend::parse(&b))
                .unwrap_or(Backend::Memory),
            tidewire: TidewireConfig::from_env(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file (path via RELAY_SERVER_CONFIG or ./relay_server.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path =
            std::env::var("RELAY_SERVER_CONFIG").unwrap_or_else(|_| "relay_server.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "relay_server", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<RelayToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "relay_server", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "relay_server", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RelayToml {
    pub server: Option<ServerToml>,
    pub sse: Option<SseToml>,
    pub socket: Option<SocketToml>,
    pub redis: Option<RedisToml>,
}

impl RelayToml {
    fn overlay(self, mut base: RelayConfig) -> RelayConfig {
        if let Some(s) = self.server {
            s.apply(&mut base);
        }
        if let Some(s) = self.sse {
            if let Some(ms) = s.heartbeat_ms {
                base.tidewire.sse.heartbeat_interval = Duration::from_millis(ms);
            }
        }
        if let Some(s) = self.socket {
            if let Some(ms) = s.ping_interval_ms {
                base.tidewire.socket.ping_interval = Duration::from_millis(ms);
            }
            if let Some(ms) = s.pong_timeout_ms {
                base.tidewire.socket.pong_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(r) = self.redis {
            if let Some(url) = r.url {
                base.tidewire.redis.url = url;
            }
            if let Some(prefix) = r.prefix {
                base.tidewire.redis.prefix = prefix;
            }
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ServerToml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backend: Option<String>,
}
impl ServerToml {
    fn apply(self, c: &mut RelayConfig) {
        if let Some(v) = self.host {
            c.host = v;
        }
        if let Some(v) = self.port {
            c.port = v;
        }
        if let Some(v) = self.backend {
            match Backend::parse(&v) {
                Some(b) => c.backend = b,
                None => {
                    tracing::warn!(target: "relay_server", backend = %v, "Unknown backend; keeping default")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SseToml {
    pub heartbeat_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SocketToml {
    pub ping_interval_ms: Option<u64>,
    pub pong_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct RedisToml {
    pub url: Option<String>,
    pub prefix: Option<String>,
}
