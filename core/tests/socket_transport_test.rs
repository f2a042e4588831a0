use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidewire_core::transport::socket::{
    parse_message, ClientEventHandler, SocketConnection, SocketMessage, SocketSession,
};
use tidewire_core::{
    EventMessage, InMemoryEmitter, PublishOptions, Result, ServerEmitter, SocketFrame,
    SocketOptions, SocketServer, TidewireError,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

struct Harness {
    emitter: Arc<InMemoryEmitter>,
    server: SocketServer,
}

fn harness(options: SocketOptions) -> Harness {
    let emitter = Arc::new(InMemoryEmitter::new());
    let server = SocketServer::new(emitter.clone(), options);
    Harness { emitter, server }
}

async fn open(
    server: &SocketServer,
    channel: Option<&str>,
) -> Result<(mpsc::Sender<String>, SocketSession)> {
    let (tx, rx) = mpsc::channel(16);
    let session = server
        .accept(ReceiverStream::new(rx), channel.map(str::to_string), None)
        .await?;
    Ok((tx, session))
}

async fn next_message(session: &mut SocketSession) -> SocketMessage {
    let text = timeout(Duration::from_secs(1), session.next_outbound())
        .await
        .expect("timeout")
        .expect("session closed");
    parse_message(&text).expect("valid frame")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn forwards_channel_events_as_frames() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (_tx, mut session) = open(&h.server, Some("room-1")).await?;
    assert_eq!(h.server.manager().connection_count(), 1);
    assert_eq!(
        h.server.manager().channel_members("room-1"),
        vec![session.connection.id()]
    );

    h.emitter
        .publish("chat", json!({"text": "hi"}), PublishOptions::channel("room-1"))
        .await?;

    match next_message(&mut session).await {
        SocketMessage::Event(msg) => {
            assert_eq!(msg.event, "chat");
            assert_eq!(msg.data["text"], "hi");
        }
        other => panic!("expected event frame, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn subscribe_frame_joins_channel() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (tx, mut session) = open(&h.server, Some("lobby")).await?;

    tx.send(SocketFrame::subscribe("room-2").encode()?).await.ok();
    settle().await;

    assert!(session.connection.in_channel("room-2"));
    assert_eq!(session.connection.channels(), vec!["lobby", "room-2"]);

    h.emitter
        .publish("chat", json!("for room 2"), PublishOptions::channel("room-2"))
        .await?;
    match next_message(&mut session).await {
        SocketMessage::Event(msg) => assert_eq!(msg.data, json!("for room 2")),
        other => panic!("expected event frame, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn overlapping_subscriptions_deliver_once() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (tx, mut session) = open(&h.server, None).await?;

    tx.send(SocketFrame::subscribe("room-1").encode()?).await.ok();
    settle().await;

    h.emitter
        .publish("chat", json!(1), PublishOptions::channel("room-1"))
        .await?;
    h.emitter
        .publish("chat", json!(2), PublishOptions::channel("room-1"))
        .await?;

    let mut seen = Vec::new();
    for _ in 0..2 {
        if let SocketMessage::Event(msg) = next_message(&mut session).await {
            seen.push(msg.data);
        }
    }
    assert_eq!(seen, vec![json!(1), json!(2)]);
    assert!(timeout(Duration::from_millis(50), session.next_outbound())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn answers_client_ping_with_pong() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (tx, mut session) = open(&h.server, None).await?;

    tx.send(SocketFrame::ping().encode()?).await.ok();
    assert_eq!(next_message(&mut session).await, SocketMessage::Pong);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closes_connection_when_pong_never_arrives() -> Result<()> {
    let h = harness(SocketOptions {
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(10),
        ..Default::default()
    });
    let (_tx, mut session) = open(&h.server, None).await?;

    let started = tokio::time::Instant::now();
    assert_eq!(
        parse_message(&session.next_outbound().await.expect("ping"))?,
        SocketMessage::Ping
    );
    assert!(started.elapsed() >= Duration::from_secs(30));

    assert!(session.next_outbound().await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(40));
    assert!(session.connection.is_closed());

    settle().await;
    assert_eq!(h.server.manager().connection_count(), 0);
    assert_eq!(h.emitter.subscriber_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pong_keeps_connection_alive() -> Result<()> {
    let h = harness(SocketOptions {
        ping_interval: Duration::from_secs(5),
        pong_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    let (tx, mut session) = open(&h.server, None).await?;

    for _ in 0..3 {
        let text = session.next_outbound().await.expect("ping");
        assert_eq!(parse_message(&text)?, SocketMessage::Ping);
        tx.send(SocketFrame::pong().encode()?).await.ok();
    }
    assert!(!session.connection.is_closed());
    assert_eq!(h.server.manager().connection_count(), 1);
    Ok(())
}

#[tokio::test]
async fn client_disconnect_removes_connection() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (tx, mut session) = open(&h.server, Some("room-1")).await?;

    drop(tx);
    assert!(timeout(Duration::from_secs(1), session.next_outbound())
        .await
        .expect("timeout")
        .is_none());

    settle().await;
    assert_eq!(h.server.manager().connection_count(), 0);
    assert!(h.server.manager().channel_members("room-1").is_empty());
    Ok(())
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<EventMessage>>,
}

#[async_trait]
impl ClientEventHandler for Recorder {
    async fn on_client_event(&self, _connection: &SocketConnection, msg: EventMessage) -> Result<()> {
        if msg.event == "forbidden" {
            return Err(TidewireError::Handler("not allowed".to_string()));
        }
        self.events.lock().push(msg);
        Ok(())
    }
}

#[tokio::test]
async fn client_events_reach_handler_and_errors_are_reported() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let emitter = Arc::new(InMemoryEmitter::new());
    let server = SocketServer::new(emitter, SocketOptions::default())
        .with_client_event_handler(recorder.clone());
    let (tx, mut session) = open(&server, None).await?;

    let ok = EventMessage::new("typing", json!({"user": "ana"}), None);
    tx.send(SocketFrame::event(&ok)?.encode()?).await.ok();
    let bad = EventMessage::new("forbidden", json!(null), None);
    tx.send(SocketFrame::event(&bad)?.encode()?).await.ok();

    match next_message(&mut session).await {
        SocketMessage::Error { message } => assert!(message.contains("not allowed")),
        other => panic!("expected error frame, got {:?}", other),
    }
    let events = recorder.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "typing");
    Ok(())
}

#[tokio::test]
async fn manager_broadcasts_to_channel_members() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (_a_tx, mut a) = open(&h.server, Some("room-1")).await?;
    let (_b_tx, mut b) = open(&h.server, Some("room-2")).await?;

    let sent = h
        .server
        .manager()
        .broadcast_to_channel("room-1", &SocketFrame::error("maintenance"));
    assert_eq!(sent, 1);
    assert!(matches!(next_message(&mut a).await, SocketMessage::Error { .. }));
    assert!(timeout(Duration::from_millis(50), b.next_outbound())
        .await
        .is_err());

    assert_eq!(h.server.manager().broadcast(&SocketFrame::ping()), 2);
    h.server.shutdown();
    assert!(a.connection.is_closed());
    assert!(b.connection.is_closed());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn zero_ping_interval_disables_pings() -> Result<()> {
    let h = harness(SocketOptions {
        ping_interval: Duration::ZERO,
        ..Default::default()
    });
    let (tx, mut session) = open(&h.server, None).await?;

    // No ping and no pong deadline, however long the connection idles
    assert!(timeout(Duration::from_secs(300), session.next_outbound())
        .await
        .is_err());
    assert!(!session.connection.is_closed());

    // Frames are still served
    tx.send(SocketFrame::ping().encode()?).await.ok();
    assert_eq!(next_message(&mut session).await, SocketMessage::Pong);

    // And cleanup still runs when the client leaves
    drop(tx);
    assert!(session.next_outbound().await.is_none());
    settle().await;
    assert!(session.connection.is_closed());
    assert_eq!(h.server.manager().connection_count(), 0);
    assert_eq!(h.emitter.subscriber_count(), 0);
    Ok(())
}

#[tokio::test]
async fn emitter_close_closes_connections() -> Result<()> {
    let h = harness(SocketOptions::default());
    let (tx, mut session) = open(&h.server, Some("room-1")).await?;
    tx.send(SocketFrame::subscribe("room-2").encode()?).await.ok();
    settle().await;

    h.emitter.close().await;

    assert!(timeout(Duration::from_secs(1), session.next_outbound())
        .await
        .expect("timeout")
        .is_none());
    assert!(session.connection.is_closed());
    settle().await;
    assert_eq!(h.server.manager().connection_count(), 0);
    assert_eq!(h.server.manager().channel_count(), 0);
    Ok(())
}
