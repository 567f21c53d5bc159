//! Unit tests for the streaming queue primitives

use chatflow_client::{ChatFlowError, FastQueue, StreamItem, StreamQueue};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_fast_queue_fifo_order() {
    let mut queue = FastQueue::new();
    assert!(queue.pop().is_none());

    queue.push(1);
    queue.push(2);
    assert_eq!(queue.peek(), Some(&1));
    assert_eq!(queue.pop(), Some(1));
    queue.push(3);
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), Some(3));
    assert!(queue.is_empty());
    assert_eq!(queue.allocated(), 0);
}

#[test]
fn test_fast_queue_compacts_consumed_prefix() {
    let mut queue = FastQueue::new();
    for i in 0..3000 {
        queue.push(i);
    }

    for expected in 0..1501 {
        assert_eq!(queue.pop(), Some(expected));
    }
    // Cursor passed 1024 slots and half the buffer: prefix dropped
    assert_eq!(queue.allocated(), 1499);
    assert_eq!(queue.len(), 1499);

    for i in 3000..3100 {
        queue.push(i);
    }
    let mut expected = 1501;
    while let Some(value) = queue.pop() {
        assert_eq!(value, expected);
        expected += 1;
    }
    assert_eq!(expected, 3100);
    assert_eq!(queue.allocated(), 0);
}

#[test]
fn test_fast_queue_interleaved_push_pop_stays_bounded() {
    let mut queue = FastQueue::new();
    let mut reference = std::collections::VecDeque::new();
    for i in 0..10_000 {
        for value in [i, i + 10_000] {
            queue.push(value);
            reference.push_back(value);
        }
        assert_eq!(queue.pop(), reference.pop_front());
    }
    assert_eq!(queue.len(), 10_000);
    assert!(queue.allocated() < 20_000);
    while let Some(expected) = reference.pop_front() {
        assert_eq!(queue.pop(), Some(expected));
    }
    assert!(queue.is_empty());
}

#[test]
fn test_stream_queue_refuses_after_terminal_item() {
    let queue = StreamQueue::new();
    assert!(queue.push(StreamItem::chunk("a")));
    assert!(queue.push(StreamItem::done("a", None)));
    assert!(!queue.push(StreamItem::chunk("late")));
    assert!(queue.is_finished());

    assert_eq!(queue.pop_blocking(), Some(StreamItem::chunk("a")));
    assert!(queue.pop_blocking().is_some_and(|item| item.done));
    assert_eq!(queue.pop_blocking(), None);
}

#[test]
fn test_stream_queue_error_item_is_terminal() {
    let queue = StreamQueue::new();
    let item = StreamItem::failed(ChatFlowError::ResponseTimeout(500));
    assert!(item.is_terminal());
    assert!(queue.push(item));
    assert!(!queue.push(StreamItem::chunk("late")));
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_pop_blocking_wakes_on_push_from_other_thread() {
    let queue = Arc::new(StreamQueue::new());
    let producer = Arc::clone(&queue);

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        producer.push(StreamItem::chunk("He"));
        producer.push(StreamItem::chunk("llo"));
        producer.push(StreamItem::done("Hello", None));
    });

    let mut texts = Vec::new();
    while let Some(item) = queue.pop_blocking() {
        if item.done {
            break;
        }
        texts.push(item.text);
    }
    handle.join().expect("producer thread");
    assert_eq!(texts, vec!["He", "llo"]);
}

#[test]
fn test_deactivate_releases_blocked_consumer() {
    let queue = Arc::new(StreamQueue::new());
    let consumer = Arc::clone(&queue);
    let handle = std::thread::spawn(move || consumer.pop_blocking());

    std::thread::sleep(Duration::from_millis(50));
    queue.deactivate();

    assert_eq!(handle.join().expect("consumer thread"), None);
    assert!(!queue.is_active());
    assert!(!queue.push(StreamItem::chunk("ignored")));
}

#[tokio::test]
async fn test_async_pop_sees_items_pushed_later() {
    let queue = Arc::new(StreamQueue::new());
    let producer = Arc::clone(&queue);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.push(StreamItem::chunk("x"));
    });

    let item = tokio::time::timeout(Duration::from_secs(1), queue.pop())
        .await
        .expect("woken")
        .expect("item");
    assert_eq!(item.text, "x");

    queue.deactivate();
    assert_eq!(queue.pop().await, None);
}
