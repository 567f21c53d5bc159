//! Unit tests for `ChatClient`
//!
//! Every test plays the server side through `MemoryConnector`.

use chatflow_client::{
    ChatClient, ChatFlowError, ChatMessage, ChatOptions, ChatRequest, ClientConfig,
    MemoryConnector, MemoryServer, ReconnectPolicy, Role, SessionState, SideContentKind,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn client(response_timeout: Duration) -> (ChatClient, Arc<MemoryConnector>) {
    init_logger();
    let config = ClientConfig::builder("ws://memory.test/chat")
        .key("test-key")
        .username("alice")
        .response_timeout(response_timeout)
        .heartbeat_interval(Duration::ZERO)
        .reconnect(ReconnectPolicy::disabled())
        .build()
        .expect("valid config");
    let connector = Arc::new(MemoryConnector::new());
    let client = ChatClient::with_connector(config, connector.clone()).expect("client");
    (client, connector)
}

/// Accept the next link, read one request and answer with `frames`
///
/// Resolves to the server side (kept alive by the caller) and the request.
fn serve(connector: &Arc<MemoryConnector>, frames: Vec<Value>) -> JoinHandle<(MemoryServer, Value)> {
    let connector = Arc::clone(connector);
    tokio::spawn(async move {
        let mut server = connector.accept().await.expect("client connects");
        let request = server.recv_request().await.expect("request");
        for frame in &frames {
            server.send_json(frame);
        }
        (server, request)
    })
}

/// Read one request on an existing link and answer with `frames`
async fn respond(server: &mut MemoryServer, frames: &[Value]) -> Value {
    let request = server.recv_request().await.expect("request");
    for frame in frames {
        server.send_json(frame);
    }
    request
}

fn hello_frames() -> Vec<Value> {
    vec![
        json!({"code": "000000", "index": -1, "dialog_id": "d-1"}),
        json!({"code": "000000", "index": 1, "data": "He"}),
        json!({"code": "000000", "index": 2, "data": "llo"}),
        json!({"code": "000000", "index": 3, "data": "!"}),
        json!({"code": "000000", "index": 4, "data": "", "finish": "y"}),
    ]
}

#[tokio::test]
async fn test_stream_yields_chunks_in_order() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(&connector, hello_frames());

    let stream = client
        .stream(ChatRequest::new().prompt("Say hello").session("s1"))
        .await
        .expect("stream");
    assert!(client.has_active_stream("s1"));
    let done = stream.done();

    let chunks: Vec<String> = stream
        .into_async()
        .map(|chunk| chunk.expect("chunk"))
        .collect()
        .await;
    assert_eq!(chunks, vec!["He", "llo", "!"]);

    let answer = done.await.expect("answer");
    assert_eq!(answer.text, "Hello!");
    assert_eq!(answer.dialog_id.as_ref().map(|d| d.as_str()), Some("d-1"));
    assert!(!client.has_active_stream("s1"));

    let (_server, request) = server.await.expect("server task");
    assert_eq!(request["question"], "Say hello");
    assert_eq!(request["segment_code"], "s1");
    assert_eq!(request["key"], "test-key");
    assert_eq!(request["username"], "alice");
}

#[tokio::test]
async fn test_stream_blocking_iterator() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(&connector, hello_frames());

    let stream = client
        .stream(ChatRequest::new().prompt("Say hello").session("blocking"))
        .await
        .expect("stream");
    let done = stream.done();

    let chunks = tokio::task::spawn_blocking(move || {
        let mut stream = stream;
        let mut chunks = Vec::new();
        while stream.has_next().expect("has_next") {
            chunks.push(stream.next_chunk().expect("chunk").expect("some chunk"));
        }
        assert_eq!(stream.next_chunk().expect("ended"), None);
        chunks
    })
    .await
    .expect("consumer thread");

    assert_eq!(chunks.concat(), "Hello!");
    assert_eq!(done.await.expect("answer").text, "Hello!");
    let _ = server.await;
}

#[tokio::test]
async fn test_finish_frame_text_used_when_nothing_streamed() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(
        &connector,
        vec![json!({"code": "000000", "data": "whole answer", "finish": "y"})],
    );

    let stream = client
        .stream(ChatRequest::new().prompt("q").session("s"))
        .await
        .expect("stream");
    let done = stream.done();
    let chunks: Vec<_> = stream.into_async().collect().await;

    assert_eq!(chunks.len(), 1);
    assert_eq!(done.await.expect("answer").text, "whole answer");
    let _ = server.await;
}

#[tokio::test]
async fn test_single_shot_send_aggregates_answer() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(
        &connector,
        vec![
            json!({"code": "000000", "index": 1, "data": "4"}),
            json!({"type": "llm_end", "data": "", "message_id": "m-9"}),
        ],
    );

    let answer = client
        .send(ChatRequest::new().prompt("What is 2 + 2?").session("math"))
        .await
        .expect("answer");

    assert_eq!(answer.text, "4");
    assert_eq!(answer.message_id.as_deref(), Some("m-9"));
    assert_eq!(client.session_state("math"), SessionState::Connected);
    assert!(client.is_connected("math"));
    let _ = server.await;
}

#[tokio::test]
async fn test_history_records_question_and_answer() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(&connector, hello_frames());

    client
        .send(ChatRequest::new().prompt("Say hello").session("h"))
        .await
        .expect("answer");

    let history = client.history("h");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "Say hello");
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[1].content, "Hello!");
    assert_eq!(history[1].dialog_id.as_ref().map(|d| d.as_str()), Some("d-1"));
    assert!(client.history("other").is_empty());
    let _ = server.await;
}

#[tokio::test(start_paused = true)]
async fn test_response_timeout_releases_session() {
    let (client, connector) = client(Duration::from_millis(500));
    let server = serve(&connector, Vec::new());

    let err = client
        .send(ChatRequest::new().prompt("anyone?").session("slow"))
        .await
        .unwrap_err();
    assert_eq!(err, ChatFlowError::ResponseTimeout(500));
    assert_eq!(client.session_state("slow"), SessionState::Connected);

    let (mut server, _) = server.await.expect("server task");
    let frames = [json!({"code": "000000", "data": "here", "finish": "y"})];
    let (answer, request) = tokio::join!(
        client.send(ChatRequest::new().prompt("again").session("slow")),
        respond(&mut server, &frames),
    );
    assert_eq!(answer.expect("second request").text, "here");
    assert_eq!(request["question"], "again");
}

#[tokio::test(start_paused = true)]
async fn test_chunks_rearm_the_timeout() {
    let (client, connector) = client(Duration::from_millis(500));
    let connector_side = Arc::clone(&connector);
    let server = tokio::spawn(async move {
        let mut server = connector_side.accept().await.expect("client connects");
        server.recv_request().await.expect("request");
        for chunk in ["a", "b", "c"] {
            tokio::time::sleep(Duration::from_millis(400)).await;
            server.send_json(&json!({"code": "000000", "index": 1, "data": chunk}));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        server.send_json(&json!({"code": "000000", "finish": "y"}));
        server
    });

    let answer = client
        .send(ChatRequest::new().prompt("slow but steady").session("steady"))
        .await
        .expect("answer");
    assert_eq!(answer.text, "abc");
    let _ = server.await;
}

#[tokio::test]
async fn test_second_request_is_rejected_while_in_flight() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move {
            let mut server = connector.accept().await.expect("client connects");
            server.recv_request().await.expect("request");
            server
        }
    });

    let _stream = client
        .stream(ChatRequest::new().prompt("first").session("busy"))
        .await
        .expect("first request");
    let err = client
        .send(ChatRequest::new().prompt("second").session("busy"))
        .await
        .unwrap_err();
    assert_eq!(err, ChatFlowError::RequestInProgress("busy".to_string()));
    assert_eq!(client.session_state("busy"), SessionState::Waiting);
    let _ = server.await;
}

#[tokio::test]
async fn test_server_error_code_fails_request() {
    let (client, connector) = client(Duration::from_secs(5));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.on_error(move |session, err| sink.lock().push((session.to_string(), err.clone())));
    let server = serve(
        &connector,
        vec![json!({"code": "500001", "message": "model overloaded"})],
    );

    let err = client
        .send(ChatRequest::new().prompt("q").session("e"))
        .await
        .unwrap_err();
    let expected = ChatFlowError::server("500001", "model overloaded");
    assert_eq!(err, expected);
    assert_eq!(errors.lock().as_slice(), [("e".to_string(), expected)]);
    let _ = server.await;
}

#[tokio::test]
async fn test_server_error_ends_stream_with_error() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(
        &connector,
        vec![
            json!({"code": "000000", "index": 1, "data": "partial"}),
            json!({"code": "400100", "message": "quota exceeded"}),
        ],
    );

    let mut stream = client
        .stream(ChatRequest::new().prompt("q").session("se"))
        .await
        .expect("stream");

    assert_eq!(stream.next_async().await, Ok(Some("partial".to_string())));
    let err = stream.next_async().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ServerError { ref code, .. } if code == "400100"));
    assert_eq!(stream.next_async().await, Ok(None));
    assert!(stream.done().await.is_err());
    let _ = server.await;
}

#[tokio::test]
async fn test_side_channel_callbacks() {
    let (client, connector) = client(Duration::from_secs(5));
    let reasoning = Arc::new(Mutex::new(Vec::new()));
    let content = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasoning);
    client.on_reasoning(move |_, text| sink.lock().push(text.to_string()));
    let sink = Arc::clone(&content);
    client.on_content(move |_, item| sink.lock().push(item.clone()));

    let server = serve(
        &connector,
        vec![
            json!({"code": "000000", "index": -5, "data": "thinking..."}),
            json!({"code": "000000", "index": -3, "data": {"results": ["a", "b"]}}),
            json!({"code": "000000", "index": -4, "data": ["img-1"]}),
            json!({"code": "000000", "index": 1, "data": "done", "finish": "y"}),
        ],
    );

    let answer = client
        .send(ChatRequest::new().prompt("search").session("side"))
        .await
        .expect("answer");

    assert_eq!(answer.text, "done");
    assert_eq!(reasoning.lock().as_slice(), ["thinking...".to_string()]);
    let content = content.lock();
    assert_eq!(content.len(), 2);
    assert_eq!(content[0].kind, SideContentKind::OnlineSearch);
    assert_eq!(content[0].data, json!({"results": ["a", "b"]}));
    assert_eq!(content[1].kind, SideContentKind::ImageReference);
    let _ = server.await;
}

#[tokio::test]
async fn test_panicking_callback_does_not_break_request() {
    let (client, connector) = client(Duration::from_secs(5));
    client.on_reasoning(|_, _| panic!("callback bug"));
    let server = serve(
        &connector,
        vec![
            json!({"code": "000000", "index": -5, "data": "hmm"}),
            json!({"code": "000000", "data": "fine", "finish": "y"}),
        ],
    );

    let answer = client
        .send(ChatRequest::new().prompt("q").session("p"))
        .await
        .expect("answer");
    assert_eq!(answer.text, "fine");
    let _ = server.await;
}

#[tokio::test]
async fn test_messages_supply_question_and_replace_legacy_fields() {
    let (client, connector) = client(Duration::from_secs(5));
    client.set_session_options(
        "m",
        ChatOptions::builder().temperature(0.3).max_tokens(64).build(),
    );
    let server = serve(
        &connector,
        vec![json!({"code": "000000", "data": "ok", "finish": "y"})],
    );

    let request = ChatRequest::new()
        .session("m")
        .prompt("ignored prompt")
        .messages(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("first question"),
            ChatMessage::assistant("first answer"),
            ChatMessage::user("follow-up"),
        ])
        .option(
            ChatOptions::builder()
                .temperature(0.9)
                .prompt_tip("legacy tip")
                .build(),
        );
    client.send(request).await.expect("answer");

    let (_server, request) = server.await.expect("server task");
    assert_eq!(request["question"], "follow-up");
    assert_eq!(request["messages"].as_array().map(Vec::len), Some(4));
    assert_eq!(request["messages"][3]["role"], "user");
    assert!(request.get("prompt_tip").is_none());
    assert_eq!(request["temperature"], 0.9);
    assert_eq!(request["max_tokens"], 64);
}

#[tokio::test]
async fn test_request_without_question_is_rejected() {
    let (client, _connector) = client(Duration::from_secs(5));
    let err = client
        .send(ChatRequest::new().session("empty").messages(vec![ChatMessage::system("x")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatFlowError::RequestFailed(_)));
    assert_eq!(client.session_state("empty"), SessionState::Connected);
}

#[tokio::test]
async fn test_frames_without_request_are_ignored() {
    let (client, connector) = client(Duration::from_secs(5));
    client.connect("idle").await.expect("connected");
    let mut server = connector.accept().await.expect("server side");

    server.send_json(&json!({"code": "000000", "data": "stray", "finish": "y"}));
    server.send_json(&json!({"code": "999999", "message": "stray error"}));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let frames = [json!({"code": "000000", "data": "real answer", "finish": "y"})];
    let (answer, _) = tokio::join!(
        client.send(ChatRequest::new().prompt("real").session("idle")),
        respond(&mut server, &frames),
    );
    assert_eq!(answer.expect("answer").text, "real answer");
    assert_eq!(client.history("idle").len(), 2);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (client, connector) = client(Duration::from_secs(5));
    let first = serve(
        &connector,
        vec![json!({"code": "000000", "data": "one", "finish": "y"})],
    );
    let a = client
        .send(ChatRequest::new().prompt("a").session("a"))
        .await
        .expect("a");
    let second = serve(
        &connector,
        vec![json!({"code": "000000", "data": "two", "finish": "y"})],
    );
    let b = client
        .send(ChatRequest::new().prompt("b").session("b"))
        .await
        .expect("b");

    assert_eq!((a.text.as_str(), b.text.as_str()), ("one", "two"));
    assert_eq!(connector.open_count(), 2);
    let _ = (first.await, second.await);
}

#[tokio::test]
async fn test_link_loss_fails_request_in_flight() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move {
            let mut server = connector.accept().await.expect("client connects");
            server.recv_request().await.expect("request");
            server.close("server going away");
        }
    });

    let err = client
        .send(ChatRequest::new().prompt("q").session("lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionClosed(_)));
    let _ = server.await;
}

#[tokio::test]
async fn test_disconnect_fails_stream_and_allows_reconnect() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = tokio::spawn({
        let connector = Arc::clone(&connector);
        async move {
            let mut server = connector.accept().await.expect("client connects");
            server.recv_request().await.expect("request");
            server
        }
    });

    let mut stream = client
        .stream(ChatRequest::new().prompt("q").session("d"))
        .await
        .expect("stream");
    let _server = server.await.expect("server task");

    client.disconnect("d");
    assert_eq!(client.session_state("d"), SessionState::Idle);
    assert!(!client.has_active_stream("d"));
    let err = stream.next_async().await.unwrap_err();
    assert!(matches!(err, ChatFlowError::ConnectionClosed(_)));
    assert!(err.is_connection_error());

    let again = serve(
        &connector,
        vec![json!({"code": "000000", "data": "back", "finish": "y"})],
    );
    let answer = client
        .send(ChatRequest::new().prompt("again").session("d"))
        .await
        .expect("reconnected");
    assert_eq!(answer.text, "back");
    assert_eq!(connector.open_count(), 2);
    let _ = again.await;
}

#[tokio::test]
async fn test_disconnect_discards_history() {
    let (client, connector) = client(Duration::from_secs(5));
    let server = serve(
        &connector,
        vec![json!({"code": "000000", "data": "hi", "finish": "y"})],
    );
    assert_eq!(client.last_completed("h"), None);

    let answer = client
        .send(ChatRequest::new().prompt("q").session("h"))
        .await
        .expect("answer");
    assert_eq!(answer.text, "hi");
    assert_eq!(client.history("h").len(), 2);
    assert!(client.last_completed("h").is_some());
    let _server = server.await.expect("server task");

    client.disconnect("h");
    assert!(client.history("h").is_empty());
    assert_eq!(client.last_completed("h"), None);
    assert_eq!(client.session_state("h"), SessionState::Idle);
    assert!(!client.is_connected("h"));
}

#[tokio::test]
async fn test_dropped_stream_still_resolves_answer() {
    let (client, connector) = client(Duration::from_secs(5));

    let stream = client
        .stream(ChatRequest::new().prompt("Say hello").session("walk"))
        .await
        .expect("stream");
    let done = stream.done();
    drop(stream);
    assert!(!client.has_active_stream("walk"));

    let mut server = connector.accept().await.expect("client connects");
    respond(&mut server, &hello_frames()).await;

    let answer = done.await.expect("answer");
    assert_eq!(answer.text, "Hello!");
    assert!(client.is_connected("walk"));
    assert!(!client.has_active_stream("walk"));
    assert_eq!(client.history("walk").len(), 2);
}

#[tokio::test]
async fn test_dropping_finished_stream_keeps_newer_stream_active() {
    let (client, connector) = client(Duration::from_secs(5));

    let first = client
        .stream(ChatRequest::new().prompt("first").session("x"))
        .await
        .expect("first stream");
    let first_done = first.done();
    let mut server = connector.accept().await.expect("client connects");
    respond(
        &mut server,
        &[json!({"code": "000000", "data": "one", "finish": "y"})],
    )
    .await;
    assert_eq!(first_done.await.expect("first answer").text, "one");

    let second = client
        .stream(ChatRequest::new().prompt("second").session("x"))
        .await
        .expect("second stream");
    let second_done = second.done();
    drop(first);
    assert!(client.has_active_stream("x"));

    respond(
        &mut server,
        &[json!({"code": "000000", "data": "two", "finish": "y"})],
    )
    .await;
    assert_eq!(second_done.await.expect("second answer").text, "two");
    assert!(client.has_active_stream("x"));
    drop(second);
    assert!(!client.has_active_stream("x"));
}

#[tokio::test]
async fn test_workflow_frames_ignored_on_chat_session() {
    let (client, connector) = client(Duration::from_secs(5));
    let mut frames = vec![json!({
        "code": "000000",
        "type": "flow",
        "event": "flow_start",
        "data": "not part of the answer"
    })];
    frames.extend(hello_frames());
    let server = serve(&connector, frames);

    let answer = client
        .send(ChatRequest::new().prompt("q").session("mixed"))
        .await
        .expect("answer");
    assert_eq!(answer.text, "Hello!");
    let _ = server.await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
    let (client, connector) = client(Duration::from_secs(5));
    client.connect("s").await.expect("connected");
    let _server = connector.accept().await.expect("server side");

    client.shutdown().await;

    assert!(!client.is_connected("s"));
    let err = client.send("late").await.unwrap_err();
    assert!(matches!(err, ChatFlowError::SessionError(_)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = ClientConfig {
        url: "http://not-a-websocket".to_string(),
        ..ClientConfig::default()
    };
    let result = ChatClient::with_connector(config, Arc::new(MemoryConnector::new()));
    assert!(matches!(result, Err(ChatFlowError::InvalidConfig(_))));
}
