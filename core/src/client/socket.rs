// Socket client: JSON frames over a websocket, with channel rejoin on reconnect

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{start, stop, ClientConfig, ClientCore, ClientTransport, ConnectionState, Handlers, Transport};
use crate::event::EventMessage;
use crate::transport::socket::{parse_message, SocketFrame, SocketMessage};
use crate::{Result, TidewireError};

/// An open duplex link: text frames out, text frames in.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SocketLink>;
}

/// [`SocketConnector`] over tokio-tungstenite.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self) -> Result<SocketLink> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TidewireError::Transport(e.to_string()))?;
        let (mut sink, stream) = ws.split();

        let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(target: "client", transport = "socket", error = %e, "Write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(_)) => {
                    debug!(target: "client", transport = "socket", "Binary frame ignored");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TidewireError::Transport(e.to_string()))),
            }
        });

        Ok(SocketLink {
            outbound,
            inbound: Box::pin(inbound),
        })
    }
}

struct SocketTransport {
    connector: Arc<dyn SocketConnector>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    channels: Mutex<Vec<String>>,
}

impl SocketTransport {
    fn send(&self, frame: &SocketFrame) -> Result<()> {
        let text = frame.encode()?;
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => Err(TidewireError::Transport("not connected".to_string())),
        }
    }

    fn handle_text(&self, text: &str, core: &ClientCore) {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "client", transport = "socket", error = %e, "Unrecognized frame ignored");
                return;
            }
        };
        match message {
            SocketMessage::Ping => {
                if let Err(e) = self.send(&SocketFrame::pong()) {
                    debug!(target: "client", transport = "socket", error = %e, "Pong not sent");
                }
            }
            SocketMessage::Event(msg) => core.receive(msg),
            SocketMessage::Error { message } => core.emit_error(TidewireError::Transport(message)),
            SocketMessage::Pong | SocketMessage::Subscribe { .. } => {}
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    type Link = SocketLink;

    async fn open(&self) -> Result<SocketLink> {
        self.connector.connect().await
    }

    async fn pump(&self, link: SocketLink, core: &ClientCore, cancel: &CancellationToken) -> Result<()> {
        let SocketLink { outbound, mut inbound } = link;
        *self.outbound.lock() = Some(outbound);

        let channels = self.channels.lock().clone();
        for channel in &channels {
            if let Err(e) = self.send(&SocketFrame::subscribe(channel)) {
                warn!(target: "client", transport = "socket", channel = %channel, error = %e, "Rejoin failed");
            }
        }

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                next = inbound.next() => next,
            };
            match next {
                Some(Ok(text)) => self.handle_text(&text, core),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        *self.outbound.lock() = None;
        outcome
    }
}

/// Reconnecting socket client.
pub struct SocketClient {
    core: Arc<ClientCore>,
    transport: Arc<SocketTransport>,
}

impl SocketClient {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        Self::with_connector(Arc::new(WsConnector::new(url)), config)
    }

    pub fn with_connector(connector: Arc<dyn SocketConnector>, config: ClientConfig) -> Self {
        Self {
            core: Arc::new(ClientCore::new("socket", config)),
            transport: Arc::new(SocketTransport {
                connector,
                outbound: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Send an event frame. While disconnected nothing is sent and an error is
    /// reported to the error handlers.
    pub fn send(&self, event: &str, data: Value) {
        if !self.core.is_connected() {
            self.core
                .emit_error(TidewireError::Transport("not connected".to_string()));
            return;
        }
        let msg = EventMessage::new(event, data, None);
        let sent = SocketFrame::event(&msg).and_then(|frame| self.transport.send(&frame));
        if let Err(e) = sent {
            self.core.emit_error(e);
        }
    }

    /// Join a server channel; remembered and rejoined after every reconnect.
    pub fn subscribe(&self, channel: &str) {
        let added = {
            let mut channels = self.transport.channels.lock();
            let known = channels.iter().any(|c| c == channel);
            if !known {
                channels.push(channel.to_string());
            }
            !known
        };
        if added && self.core.is_connected() {
            if let Err(e) = self.transport.send(&SocketFrame::subscribe(channel)) {
                self.core.emit_error(e);
            }
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.transport.channels.lock().clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.core.attempts()
    }
}

impl ClientTransport for SocketClient {
    fn connect(&self) {
        start(&self.core, &self.transport);
    }

    fn disconnect(&self) {
        stop(&self.core);
        *self.transport.outbound.lock() = None;
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

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.core.driver.lock().take() {
            cancel.cancel();
        }
    }
}
