//! Unit tests for connection registries

use chatflow_client::{
    ChatFlowError, ClientConfig, ConnectionRegistry, ConnectionState, MemoryConnector,
    MultiSessionRegistry, ReconnectPolicy, SessionId, SingleConnectionRegistry,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder("ws://memory.test/chat")
            .heartbeat_interval(Duration::ZERO)
            .reconnect(ReconnectPolicy::disabled())
            .build()
            .expect("valid config"),
    )
}

#[tokio::test]
async fn test_multi_session_isolation() {
    let connector = Arc::new(MemoryConnector::new());
    let registry = MultiSessionRegistry::new(config(), connector.clone());
    let a = SessionId::new("a");
    let b = SessionId::new("b");

    assert_eq!(registry.state(&a), ConnectionState::NotExist);

    registry.connect(&a).await.expect("a connected");
    registry.connect(&b).await.expect("b connected");
    assert_eq!(connector.open_count(), 2);
    assert_eq!(registry.session_ids(), vec![a.clone(), b.clone()]);

    let first = registry.get(&a).expect("a");
    let again = registry.get(&a).expect("a again");
    assert!(first.ptr_eq(&again));
    assert!(!first.ptr_eq(&registry.get(&b).expect("b")));

    registry.disconnect(&a);
    assert_eq!(registry.state(&a), ConnectionState::NotExist);
    assert!(registry.is_connected(&b));
    assert_eq!(first.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_closed_entry_is_replaced() {
    let connector = Arc::new(MemoryConnector::new());
    let registry = MultiSessionRegistry::new(config(), connector.clone());
    let id = SessionId::new("reuse");

    let first = registry.get(&id).expect("created");
    first.close();

    let second = registry.get(&id).expect("replaced");
    assert!(!first.ptr_eq(&second));
    assert_eq!(second.state(), ConnectionState::Disconnected);
    second.connect().await.expect("connected");
}

#[tokio::test]
async fn test_single_registry_ignores_session_id() {
    let connector = Arc::new(MemoryConnector::new());
    let registry = SingleConnectionRegistry::new(config(), connector.clone());

    registry.connect(&SessionId::new("x")).await.expect("connected");
    let y = registry.get(&SessionId::new("y")).expect("same connection");

    assert_eq!(y.session_id().as_str(), "x");
    assert!(registry.is_connected(&SessionId::new("anything")));
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn test_registry_refuses_after_shutdown() {
    let connector = Arc::new(MemoryConnector::new());
    let registry = MultiSessionRegistry::new(config(), connector.clone());
    let id = SessionId::new("s");
    let connection = registry.get(&id).expect("created");
    connection.connect().await.expect("connected");

    registry.shutdown(Duration::from_millis(200)).await;

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        registry.get(&id),
        Err(ChatFlowError::SessionError(_))
    ));
    let err = registry.connect(&id).await.unwrap_err();
    assert!(matches!(err, ChatFlowError::SessionError(_)));
    assert_eq!(registry.state(&id), ConnectionState::NotExist);
}

#[tokio::test]
async fn test_single_registry_shutdown() {
    let connector = Arc::new(MemoryConnector::new());
    let registry = SingleConnectionRegistry::new(config(), connector);
    let id = SessionId::new("flow");
    registry.connect(&id).await.expect("connected");

    registry.shutdown(Duration::from_millis(200)).await;

    assert!(registry.lookup(&id).is_none());
    assert!(registry.get(&id).is_err());
}
