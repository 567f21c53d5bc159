//! Unit tests for the workflow handler registry

use chatflow_client::hooks::{HandlerRegistry, invoke};
use chatflow_client::{ChatFlowError, FlowEvent, FlowEventType, FlowMessage, NodeInfo};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn message(text: &str) -> FlowEvent {
    FlowEvent::Message(FlowMessage {
        text: text.to_string(),
        node: NodeInfo::default(),
        finished: false,
    })
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&FlowEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    (count, move |_: &FlowEvent| {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_handlers_receive_only_matching_events() {
    let mut registry = HandlerRegistry::new();
    let (messages, on_message) = counter();
    let (all, on_all) = counter();
    registry.register([FlowEventType::Message], HandlerRegistry::handler(on_message));
    registry.register_all(HandlerRegistry::handler(on_all));

    registry.dispatch(&message("hi"));
    registry.dispatch(&FlowEvent::Connected);
    registry.dispatch(&FlowEvent::Jump(NodeInfo::default()));

    assert_eq!(messages.load(Ordering::SeqCst), 1);
    assert_eq!(all.load(Ordering::SeqCst), 3);
    assert_eq!(registry.count(FlowEventType::Message), 2);
    assert_eq!(registry.count(FlowEventType::End), 1);
}

#[test]
fn test_empty_kind_set_matches_nothing() {
    let mut registry = HandlerRegistry::new();
    let (count, handler) = counter();
    registry.register(std::iter::empty(), HandlerRegistry::handler(handler));

    registry.dispatch(&message("hi"));
    registry.dispatch(&FlowEvent::Disconnected);

    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_handlers_run_in_registration_order() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    for i in 0..3 {
        let order = Arc::clone(&order);
        registry.register_all(HandlerRegistry::handler(move |_| order.lock().push(i)));
    }

    registry.dispatch(&FlowEvent::Connected);

    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn test_panicking_handler_is_isolated() {
    let mut registry = HandlerRegistry::new();
    let (before, first) = counter();
    let (after, last) = counter();
    registry.register_all(HandlerRegistry::handler(first));
    registry.register([FlowEventType::Message], HandlerRegistry::handler(|_| panic!("boom")));
    registry.register_all(HandlerRegistry::handler(last));

    let errors = registry.dispatch(&message("hi"));

    assert_eq!(errors, vec![ChatFlowError::unknown("boom")]);
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invoke_snapshot_reports_formatted_panics() {
    let handlers = vec![HandlerRegistry::handler(|event| {
        panic!("cannot handle {:?}", event.event_type())
    })];

    let errors = invoke(&handlers, &FlowEvent::Reconnecting);

    assert_eq!(errors, vec![ChatFlowError::unknown("cannot handle Reconnecting")]);
}

#[test]
fn test_remove_and_clear() {
    let mut registry = HandlerRegistry::new();
    let (count, handler) = counter();
    let id = registry.register([FlowEventType::Message], HandlerRegistry::handler(handler));
    let other = registry.register_all(HandlerRegistry::handler(|_| {}));

    assert!(registry.remove(id));
    assert!(!registry.remove(id));
    registry.dispatch(&message("hi"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(registry.count(FlowEventType::Message), 1);

    registry.clear();
    assert_eq!(registry.count(FlowEventType::Message), 0);
    assert!(!registry.remove(other));
}

#[test]
fn test_snapshot_is_detached_from_registry() {
    let mut registry = HandlerRegistry::new();
    let (count, handler) = counter();
    registry.register_all(HandlerRegistry::handler(handler));

    let snapshot = registry.snapshot(FlowEventType::End);
    registry.clear();
    invoke(&snapshot, &FlowEvent::Connected);

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
