// SSE client: parse a text/event-stream body into events

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{start, stop, ClientConfig, ClientCore, ClientTransport, ConnectionState, Handlers, Transport};
use crate::event::EventMessage;
use crate::{Result, TidewireError};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Opens the raw event-stream body.
#[async_trait]
pub trait SseConnector: Send + Sync + 'static {
    /// `last_event_id` is the id of the last event seen on a previous connection.
    async fn connect(&self, last_event_id: Option<String>) -> Result<ByteStream>;
}

/// [`SseConnector`] over HTTP GET.
pub struct HttpSseConnector {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpSseConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl SseConnector for HttpSseConnector {
    async fn connect(&self, last_event_id: Option<String>) -> Result<ByteStream> {
        let mut request = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = last_event_id {
            request = request.header("last-event-id", id);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TidewireError::Transport(format!("unexpected status {}", status)));
        }
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);
        if !is_event_stream {
            return Err(TidewireError::Transport(
                "response is not text/event-stream".to_string(),
            ));
        }

        Ok(Box::pin(
            response.bytes_stream().map(|chunk| chunk.map_err(transport_error)),
        ))
    }
}

fn transport_error(e: reqwest::Error) -> TidewireError {
    TidewireError::Transport(e.to_string())
}

/// One dispatched event-stream block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
    pub retry: Option<u64>,
}

/// Longest line [`SseParser`] buffers before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental event-stream parser. Chunks may split lines or UTF-8 sequences.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    // Bytes of `buffer` already searched for a newline
    scanned: usize,
    max_line: usize,
    last_id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    retry: Option<u64>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            last_id: None,
            event: None,
            data: Vec::new(),
            retry: None,
        }
    }

    /// Consume a chunk and return the blocks it completed.
    ///
    /// Fails when a single line grows past the configured maximum.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let mut line = &self.buffer[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            self.scanned = start;
            if let Some(frame) = self.line(&line) {
                frames.push(frame);
            }
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            self.buffer.clear();
            self.scanned = 0;
            return Err(TidewireError::Transport(format!(
                "event-stream line exceeds {} bytes",
                self.max_line
            )));
        }
        Ok(frames)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            id: self.last_id.clone(),
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            retry,
        })
    }
}

#[derive(Deserialize)]
struct DataLine {
    data: Value,
    timestamp: i64,
}

struct SseTransport {
    connector: Arc<dyn SseConnector>,
    last_event_id: Mutex<Option<String>>,
}

impl SseTransport {
    fn handle_frame(&self, frame: SseFrame, core: &ClientCore) {
        if let Some(id) = &frame.id {
            *self.last_event_id.lock() = Some(id.clone());
        }
        if let Some(retry) = frame.retry {
            core.set_retry_hint(Duration::from_millis(retry));
        }

        let line: DataLine = match serde_json::from_str(&frame.data) {
            Ok(line) => line,
            Err(e) => {
                core.emit_error(TidewireError::Transport(format!(
                    "malformed data for '{}': {}",
                    frame.event, e
                )));
                return;
            }
        };

        core.receive(EventMessage {
            id: frame.id.unwrap_or_default(),
            event: frame.event,
            data: line.data,
            timestamp: line.timestamp,
            retry: frame.retry,
        });
    }
}

#[async_trait]
impl Transport for SseTransport {
    type Link = ByteStream;

    async fn open(&self) -> Result<ByteStream> {
        let last_event_id = self.last_event_id.lock().clone();
        self.connector.connect(last_event_id).await
    }

    async fn pump(&self, mut body: ByteStream, core: &ClientCore, cancel: &CancellationToken) -> Result<()> {
        let mut parser = SseParser::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.feed(&bytes)? {
                        self.handle_frame(frame, core);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => {
                    debug!(target: "client", transport = "sse", "Event stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Reconnecting Server-Sent Events client.
pub struct SseClient {
    core: Arc<ClientCore>,
    transport: Arc<SseTransport>,
}

impl SseClient {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_connector(Arc::new(HttpSseConnector::new(url)), config)
    }

    pub fn with_connector(connector: Arc<dyn SseConnector>, config: ClientConfig) -> Self {
        Self {
            core: Arc::new(ClientCore::new("sse", config)),
            transport: Arc::new(SseTransport {
                connector,
                last_event_id: Mutex::new(None),
            }),
        }
    }

    /// Id of the last event received; sent as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<String> {
        self.transport.last_event_id.lock().clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.core.attempts()
    }
}

impl ClientTransport for SseClient {
    fn connect(&self) {
        start(&self.core, &self.transport);
    }

    fn disconnect(&self) {
        stop(&self.core);
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn handlers(&self) -> &Arc<Handlers> {
        self.core.handlers()
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.core.driver.lock().take() {
            cancel.cancel();
        }
    }
}
