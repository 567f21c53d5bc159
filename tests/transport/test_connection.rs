//! Unit tests for `Connection`
//!
//! Tests connect idempotency, frame delivery, heartbeats, reconnection and
//! close semantics against the in-memory connector

use chatflow_client::message::HEARTBEAT_FRAME;
use chatflow_client::transport::OutboundFrame;
use chatflow_client::{
    ChatFlowError, ClientConfig, Connection, ConnectionState, MemoryConnector, ReconnectPolicy,
    RequestEnvelope, ResponseEnvelope, SessionId,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(reconnect: ReconnectPolicy) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder("ws://memory.test/chat")
            .heartbeat_interval(Duration::ZERO)
            .handshake_timeout(Duration::from_millis(200))
            .reconnect(reconnect)
            .build()
            .expect("valid config"),
    )
}

fn connection(connector: &Arc<MemoryConnector>, reconnect: ReconnectPolicy) -> Connection {
    Connection::new(SessionId::new("s1"), config(reconnect), connector.clone())
}

fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        base_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(1),
        max_attempts,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {what}");
}

#[tokio::test]
async fn test_concurrent_connects_share_one_handshake() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    connector.set_handshake_delay(Duration::from_millis(50));
    let connection = connection(&connector, ReconnectPolicy::disabled());

    let attempts: Vec<_> = (0..8).map(|_| connection.connect()).collect();
    let results = futures::future::join_all(attempts).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(connector.open_count(), 1);
    assert!(connection.is_connected());

    let _server = connector.accept().await.expect("server side");
    connection.connect().await.expect("already connected");
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_from_many_tasks() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    connector.set_handshake_delay(Duration::from_millis(20));
    let connection = connection(&connector, ReconnectPolicy::disabled());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect().await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("task").expect("connected");
    }

    assert_eq!(connector.open_count(), 1);
    assert_eq!(connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_failure_returns_to_disconnected() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, ReconnectPolicy::disabled());

    connector.fail_next(ChatFlowError::connection_failed("refused"));
    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionFailed(_)));
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.connect().await.expect("second attempt succeeds");
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    connector.set_handshake_delay(Duration::from_secs(5));
    let connection = connection(&connector, ReconnectPolicy::disabled());

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionTimeout(_)));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_invalid_url_fails_without_handshake() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let config = Arc::new(ClientConfig {
        url: "not a url".to_string(),
        ..ClientConfig::default()
    });
    let connection = Connection::new(SessionId::new("bad"), config, connector.clone());

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionFailed(_)));
    assert_eq!(connector.open_count(), 0);
}

#[tokio::test]
async fn test_messages_delivered_and_heartbeats_dropped() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, ReconnectPolicy::disabled());

    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseEnvelope>();
    connection.on_message(move |envelope| {
        let _ = tx.send(envelope.clone());
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connection.on_error(move |err| sink.lock().push(err.clone()));

    connection.connect().await.expect("connected");
    let server = connector.accept().await.expect("server side");
    server.send_text("pong");
    server.send_text(r#"{"type":"heartbeat"}"#);
    server.send_text("not json");
    server.send_json(&json!({"code": "000000", "index": 1, "data": "hi"}));

    let envelope = rx.recv().await.expect("message");
    assert_eq!(envelope.text(), "hi");
    assert!(rx.try_recv().is_err());

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ChatFlowError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_send_requires_connection() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, ReconnectPolicy::disabled());
    let envelope = RequestEnvelope {
        question: "hi".to_string(),
        ..RequestEnvelope::default()
    };

    assert!(matches!(
        connection.send(&envelope),
        Err(ChatFlowError::SendFailed(_))
    ));

    connection.connect().await.expect("connected");
    let mut server = connector.accept().await.expect("server side");
    connection.send(&envelope).expect("sent");

    let request = server.recv_request().await.expect("request");
    assert_eq!(request["question"], "hi");
    assert!(request.get("key").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_frames_are_sent() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let config = Arc::new(
        ClientConfig::builder("ws://memory.test/chat")
            .heartbeat_interval(Duration::from_secs(30))
            .reconnect(ReconnectPolicy::disabled())
            .build()
            .expect("valid config"),
    );
    let connection = Connection::new(SessionId::new("hb"), config, connector.clone());
    connection.connect().await.expect("connected");
    let mut server = connector.accept().await.expect("server side");

    for _ in 0..2 {
        let frame = server.recv_frame().await.expect("frame");
        assert_eq!(frame, OutboundFrame::Text(HEARTBEAT_FRAME.to_string()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_link_drop() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, fast_reconnect(Some(5)));
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    connection.on_state_change(move |state| sink.lock().push(state));

    connection.connect().await.expect("connected");
    let first = connector.accept().await.expect("first link");
    first.close("server restart");

    let _second = connector.accept().await.expect("second link");
    eventually("reconnected", || connection.is_connected()).await;

    assert_eq!(connector.open_count(), 2);
    assert_eq!(connection.reconnect_attempts(), 0);
    eventually("state history", || {
        states.lock().as_slice()
            == [
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_attempts() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, fast_reconnect(Some(2)));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connection.on_error(move |err| sink.lock().push(err.clone()));

    connection.connect().await.expect("connected");
    let server = connector.accept().await.expect("server side");
    connector.fail_next(ChatFlowError::connection_failed("refused"));
    connector.fail_next(ChatFlowError::connection_failed("refused"));
    server.close("gone");

    eventually("exhausted", || !errors.lock().is_empty()).await;
    let err = errors.lock()[0].clone();
    assert!(matches!(err, ChatFlowError::ConnectionFailed(ref msg) if msg.contains("exhausted")));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open_count(), 3);
}

#[tokio::test]
async fn test_no_reconnect_when_disabled() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, ReconnectPolicy::disabled());
    connection.connect().await.expect("connected");
    let server = connector.accept().await.expect("server side");

    server.close("bye");
    eventually("disconnected", || {
        connection.state() == ConnectionState::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn test_close_is_terminal_and_idempotent() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, fast_reconnect(None));
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    connection.on_state_change(move |state| sink.lock().push(state));

    connection.connect().await.expect("connected");
    let mut server = connector.accept().await.expect("server side");

    connection.close();
    connection.close();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(server.recv_frame().await, Some(OutboundFrame::Close));
    assert_eq!(
        states.lock().iter().filter(|s| **s == ConnectionState::Closed).count(),
        1
    );

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionClosed(_)));
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_tasks() {
    init_logger();
    let connector = Arc::new(MemoryConnector::new());
    let connection = connection(&connector, fast_reconnect(None));
    connection.connect().await.expect("connected");
    let _server = connector.accept().await.expect("server side");

    tokio::time::timeout(Duration::from_secs(1), connection.shutdown(Duration::from_millis(500)))
        .await
        .expect("shutdown finishes within grace");
    assert_eq!(connection.state(), ConnectionState::Closed);
}
