// Environment-driven configuration for servers and clients

use std::str::FromStr;
use std::time::Duration;

use crate::client::{ClientConfig, ReconnectConfig};
use crate::emitter::RedisEmitterConfig;
use crate::transport::socket::SocketOptions;
use crate::transport::sse::SseOptions;

/// Aggregate configuration.
///
/// Every value falls back to its default when the variable is unset or does
/// not parse:
///
/// | Variable | Default |
/// |---|---|
/// | `TIDEWIRE_HEARTBEAT_INTERVAL_MS` | 30000 (0 disables) |
/// | `TIDEWIRE_PING_INTERVAL_MS` | 30000 (0 disables) |
/// | `TIDEWIRE_PONG_TIMEOUT_MS` | 10000 |
/// | `TIDEWIRE_REDIS_URL` | `redis://127.0.0.1:6379` |
/// | `TIDEWIRE_REDIS_PREFIX` | `events:` |
/// | `TIDEWIRE_VALIDATE` | true |
/// | `TIDEWIRE_RECONNECT` | true |
/// | `TIDEWIRE_RECONNECT_MAX_ATTEMPTS` | unbounded |
/// | `TIDEWIRE_RECONNECT_DELAY_MS` | 1000 |
/// | `TIDEWIRE_RECONNECT_MAX_DELAY_MS` | 30000 |
/// | `TIDEWIRE_RECONNECT_MULTIPLIER` | 2.0 |
#[derive(Clone, Debug, Default)]
pub struct TidewireConfig {
    pub sse: SseOptions,
    pub socket: SocketOptions,
    pub redis: RedisEmitterConfig,
    pub client: ClientConfig,
}

impl TidewireConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());
        let millis = |key: &str, fallback: Duration| {
            parse(key)
                .and_then(|v| u64::from_str(&v).ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let reconnect_defaults = defaults.client.reconnect.clone();
        let reconnect = ReconnectConfig {
            enabled: parse("TIDEWIRE_RECONNECT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(reconnect_defaults.enabled),
            max_attempts: parse("TIDEWIRE_RECONNECT_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .or(reconnect_defaults.max_attempts),
            delay: millis("TIDEWIRE_RECONNECT_DELAY_MS", reconnect_defaults.delay),
            max_delay: millis("TIDEWIRE_RECONNECT_MAX_DELAY_MS", reconnect_defaults.max_delay),
            multiplier: parse("TIDEWIRE_RECONNECT_MULTIPLIER")
                .and_then(|v| v.parse().ok())
                .filter(|m: &f64| m.is_finite() && *m >= 1.0)
                .unwrap_or(reconnect_defaults.multiplier),
        };

        Self {
            sse: SseOptions {
                heartbeat_interval: millis(
                    "TIDEWIRE_HEARTBEAT_INTERVAL_MS",
                    defaults.sse.heartbeat_interval,
                ),
                ..defaults.sse
            },
            socket: SocketOptions {
                ping_interval: millis("TIDEWIRE_PING_INTERVAL_MS", defaults.socket.ping_interval),
                pong_timeout: millis("TIDEWIRE_PONG_TIMEOUT_MS", defaults.socket.pong_timeout),
                ..defaults.socket
            },
            redis: RedisEmitterConfig {
                url: parse("TIDEWIRE_REDIS_URL").unwrap_or(defaults.redis.url),
                prefix: lookup("TIDEWIRE_REDIS_PREFIX").unwrap_or(defaults.redis.prefix),
            },
            client: ClientConfig {
                validate: parse("TIDEWIRE_VALIDATE")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.client.validate),
                reconnect,
                ..defaults.client
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = TidewireConfig::from_lookup(lookup(&[]));
        assert_eq!(config.sse.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.socket.pong_timeout, Duration::from_secs(10));
        assert_eq!(config.redis.prefix, "events:");
        assert!(config.client.validate);
        assert!(config.client.reconnect.enabled);
        assert_eq!(config.client.reconnect.max_attempts, None);
    }

    #[test]
    fn overrides_and_ignores_garbage() {
        let config = TidewireConfig::from_lookup(lookup(&[
            ("TIDEWIRE_HEARTBEAT_INTERVAL_MS", "0"),
            ("TIDEWIRE_PING_INTERVAL_MS", "500"),
            ("TIDEWIRE_PONG_TIMEOUT_MS", "soon"),
            ("TIDEWIRE_REDIS_PREFIX", "app:"),
            ("TIDEWIRE_RECONNECT", "false"),
            ("TIDEWIRE_RECONNECT_MAX_ATTEMPTS", "3"),
            ("TIDEWIRE_RECONNECT_MULTIPLIER", "0.5"),
        ]));
        assert!(config.sse.heartbeat_interval.is_zero());
        assert_eq!(config.socket.ping_interval, Duration::from_millis(500));
        assert_eq!(config.socket.pong_timeout, Duration::from_secs(10));
        assert_eq!(config.redis.prefix, "app:");
        assert!(!config.client.reconnect.enabled);
        assert_eq!(config.client.reconnect.max_attempts, Some(3));
        assert_eq!(config.client.reconnect.multiplier, 2.0);
    }
}
