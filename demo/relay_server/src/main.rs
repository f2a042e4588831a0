mod config;
use config::{Backend, RelayConfig};

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tidewire_core::transport::sse::create_response;
use tidewire_core::{
    InMemoryEmitter, PublishOptions, RedisEmitter, ServerEmitter, SocketServer, SseOptions,
    SubscribeOptions, TidewireError,
};
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    emitter: Arc<dyn ServerEmitter>,
    sockets: Arc<SocketServer>,
    sse: SseOptions,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    event: String,
    #[serde(default)]
    data: Value,
    channel: Option<String>,
    retry: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,tidewire_core=info,relay_server=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = RelayConfig::load();

    let emitter: Arc<dyn ServerEmitter> = match cfg.backend {
        Backend::Memory => Arc::new(InMemoryEmitter::new()),
        Backend::Redis => Arc::new(RedisEmitter::connect(cfg.tidewire.redis.clone()).await?),
    };
    let sockets = Arc::new(SocketServer::new(
        Arc::clone(&emitter),
        cfg.tidewire.socket.clone(),
    ));

    let state = AppState {
        emitter: Arc::clone(&emitter),
        sockets: Arc::clone(&sockets),
        sse: cfg.tidewire.sse.clone(),
    };

    let app = Router::new()
        .route("/events", get(events_handler))
        .route("/ws", get(ws_handler))
        .route("/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = cfg.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        target: "relay_server",
        url = %format!("http://{}", addr),
        backend = ?cfg.backend,
        "Relay server ready"
    );

    // Open streams never finish on their own; close them so graceful shutdown can complete.
    let shutdown = {
        let emitter = Arc::clone(&emitter);
        let sockets = Arc::clone(&sockets);
        async move {
            let _ = signal::ctrl_c().await;
            info!(target: "relay_server", "Shutdown requested");
            sockets.shutdown();
            emitter.close().await;
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!(target: "relay_server", "Relay server stopped");
    Ok(())
}

/// GET /events?channel= : Server-Sent Events stream
async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(last_id) = headers.get("last-event-id").and_then(|v| v.to_str().ok()) {
        // No replay buffer: resuming clients continue with live events
        info!(target: "relay_server", last_event_id = %last_id, "SSE client resuming");
    }

    let opts = match query.channel {
        Some(channel) => SubscribeOptions::channel(channel),
        None => SubscribeOptions::default(),
    };
    let subscription = match state.emitter.subscribe(opts).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(target: "relay_server", error = %e, "SSE subscribe failed");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    let (status, headers, body) = create_response(subscription, state.sse.clone()).into_parts();
    let mut response = Response::new(Body::from_stream(body.map(Ok::<_, Infallible>)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// GET /ws?channel= : WebSocket upgrade
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChannelQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, socket, query.channel, remote))
}

async fn serve_socket(
    state: AppState,
    socket: WebSocket,
    channel: Option<String>,
    remote: SocketAddr,
) {
    let (mut sender, receiver) = socket.split();
    let inbound = receiver
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });

    let mut session = match state
        .sockets
        .accept(Box::pin(inbound), channel, Some(remote.to_string()))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(target: "relay_server", remote = %remote, error = %e, "Socket accept failed");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    while let Some(text) = session.next_outbound().await {
        if sender.send(Message::Text(text)).await.is_err() {
            session.connection.close();
            break;
        }
    }
    let _ = sender.close().await;
}

/// POST /publish : publish one event
async fn publish_handler(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Response {
    let opts = PublishOptions {
        channel: req.channel,
        retry: req.retry,
    };
    match state.emitter.publish(&req.event, req.data, opts).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "published" }))).into_response(),
        Err(e) => {
            warn!(target: "relay_server", event = ?req.event, error = %e, "Publish failed");
            let status = match e {
                TidewireError::InvalidEventName(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// GET /health : live counts
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let manager = state.sockets.manager();
    Json(json!({
        "status": "ok",
        "subscribers": state.emitter.subscriber_count(),
        "connections": manager.connection_count(),
        "channels": manager.channel_count(),
    }))
}
