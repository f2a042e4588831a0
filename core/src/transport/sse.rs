// Server-Sent Events transport
//
// Turns a subscription into a continuously flushed byte stream for a long-lived
// HTTP response. Framework adapters copy `status`/`headers` onto their response
// type and stream `body` as-is.

use async_stream::stream;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{check_event_name, EventMessage};
use crate::queue::Subscription;
use crate::{now_ms, Result, TidewireError};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Options for [`create_response`].
#[derive(Clone, Debug)]
pub struct SseOptions {
    /// Comment-line keep-alive period; `Duration::ZERO` disables heartbeats
    pub heartbeat_interval: Duration,
    /// Extra headers; these override the defaults on conflict
    pub headers: HeaderMap,
    pub cancel: Option<CancellationToken>,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            headers: HeaderMap::new(),
            cancel: None,
        }
    }
}

impl SseOptions {
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub type SseBody = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// A ready-to-serve event-stream response.
pub struct SseResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: SseBody,
    cancel: CancellationToken,
}

impl SseResponse {
    /// End the stream. Closing an already closed stream is a no-op.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token that ends the stream when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, SseBody) {
        (self.status, self.headers, self.body)
    }
}

impl std::fmt::Debug for SseResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Fixed event-stream headers merged with caller overrides.
pub fn response_headers(overrides: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache, no-transform"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    for (name, value) in overrides.iter() {
        headers.insert(name.clone(), value.clone());
    }
    headers
}

#[derive(Serialize)]
struct DataLine<'a> {
    data: &'a Value,
    timestamp: i64,
}

/// Encode one message block: `id`, `event`, optional `retry`, `data`, blank line.
///
/// Messages that did not pass through `publish` (e.g. read off Redis) may carry
/// a name or id with line breaks; those are refused rather than written.
pub fn encode_event(msg: &EventMessage) -> Result<String> {
    check_event_name(&msg.event)?;
    if msg.id.contains(|c| c == '\r' || c == '\n') {
        return Err(TidewireError::Transport(format!("invalid event id {:?}", msg.id)));
    }
    let data = serde_json::to_string(&DataLine {
        data: &msg.data,
        timestamp: msg.timestamp,
    })?;
    let mut block = format!("id: {}\nevent: {}\n", msg.id, msg.event);
    if let Some(retry) = msg.retry {
        block.push_str(&format!("retry: {}\n", retry));
    }
    block.push_str(&format!("data: {}\n\n", data));
    Ok(block)
}

pub fn encode_heartbeat(unix_ms: i64) -> String {
    format!(": heartbeat {}\n\n", unix_ms)
}

async fn next_heartbeat(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

enum Step {
    Message(EventMessage),
    Heartbeat,
    End(&'static str),
}

/// Stream `subscription` as an SSE response body.
///
/// The body ends when the subscription ends, the caller's cancel token fires,
/// or [`SseResponse::close`] is called. The heartbeat timer and the
/// subscription are released with the body.
pub fn create_response(mut subscription: Subscription, opts: SseOptions) -> SseResponse {
    let cancel = opts
        .cancel
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_else(CancellationToken::new);
    let headers = response_headers(&opts.headers);
    let heartbeat_interval = opts.heartbeat_interval;
    let token = cancel.clone();
    let subscription_id = subscription.id();

    let body = stream! {
        let mut heartbeat = if heartbeat_interval.is_zero() {
            None
        } else {
            Some(interval_at(Instant::now() + heartbeat_interval, heartbeat_interval))
        };
        info!(target: "sse", subscription_id, "SSE stream opened");

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => Step::End("cancelled"),
                _ = next_heartbeat(&mut heartbeat) => Step::Heartbeat,
                next = subscription.next() => match next {
                    Some(msg) => Step::Message(msg),
                    None => Step::End("subscription ended"),
                },
            };
            match step {
                Step::Message(msg) => match encode_event(&msg) {
                    Ok(block) => yield Bytes::from(block),
                    Err(e) => {
                        warn!(target: "sse", event_id = %msg.id, error = %e, "Failed to encode event");
                    }
                },
                Step::Heartbeat => {
                    debug!(target: "sse", subscription_id, "Heartbeat");
                    yield Bytes::from(encode_heartbeat(now_ms()));
                }
                Step::End(reason) => break reason,
            }
        };

        token.cancel();
        info!(target: "sse", subscription_id, reason, "SSE stream closed");
    };

    SseResponse {
        status: StatusCode::OK,
        headers,
        body: Box::pin(body),
        cancel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_event_block() {
        let msg = EventMessage {
            id: "42".to_string(),
            event: "message".to_string(),
            data: json!({"title": "Hello"}),
            timestamp: 1_700_000_000_000,
            retry: None,
        };
        assert_eq!(
            encode_event(&msg).unwrap(),
            "id: 42\nevent: message\ndata: {\"data\":{\"title\":\"Hello\"},\"timestamp\":1700000000000}\n\n"
        );
    }

    #[test]
    fn encodes_retry_hint_before_data() {
        let msg = EventMessage {
            id: "1".to_string(),
            event: "tick".to_string(),
            data: json!(1),
            timestamp: 5,
            retry: Some(3000),
        };
        let block = encode_event(&msg).unwrap();
        assert!(block.starts_with("id: 1\nevent: tick\nretry: 3000\ndata: "));
        assert!(block.ends_with("\n\n"));
    }

    #[test]
    fn refuses_line_breaks_in_name_or_id() {
        let mut msg = EventMessage {
            id: "1".to_string(),
            event: "message\ndata: {}".to_string(),
            data: json!(null),
            timestamp: 5,
            retry: None,
        };
        assert!(matches!(
            encode_event(&msg),
            Err(TidewireError::InvalidEventName(_))
        ));

        msg.event = "message".to_string();
        msg.id = "1\nevent: other".to_string();
        assert!(encode_event(&msg).is_err());
    }

    #[test]
    fn heartbeat_is_comment_line() {
        assert_eq!(encode_heartbeat(123), ": heartbeat 123\n\n");
    }

    #[test]
    fn caller_headers_override_defaults() {
        let mut overrides = HeaderMap::new();
        overrides.insert(CACHE_CONTROL, HeaderValue::from_static("private"));
        overrides.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("abc"),
        );

        let headers = response_headers(&overrides);
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "private");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert_eq!(headers["x-request-id"], "abc");
    }
}
