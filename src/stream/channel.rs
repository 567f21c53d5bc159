//! Producer/consumer queue feeding one chat stream

use parking_lot::{Condvar, Mutex};
use std::pin::pin;
use tokio::sync::Notify;

use super::queue::FastQueue;
use crate::error::ChatFlowError;

/// Unit handed from the inbound path to a stream consumer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    /// Chunk text, or the full answer on the terminal item
    pub text: String,
    /// Whether this is the terminal item
    pub done: bool,
    /// Error ending the stream
    pub error: Option<ChatFlowError>,
    /// Dialog id, set on the terminal item
    pub dialog_id: Option<String>,
}

impl StreamItem {
    /// Intermediate text chunk
    pub fn chunk(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
            error: None,
            dialog_id: None,
        }
    }

    /// Terminal item carrying the full answer
    pub fn done(text: impl Into<String>, dialog_id: Option<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
            error: None,
            dialog_id,
        }
    }

    /// Terminal error item
    #[must_use]
    pub fn failed(error: ChatFlowError) -> Self {
        Self {
            text: String::new(),
            done: false,
            error: Some(error),
            dialog_id: None,
        }
    }

    /// Whether no item may follow this one
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

#[derive(Debug)]
struct Inner {
    items: FastQueue<StreamItem>,
    finished: bool,
    active: bool,
}

/// Queue of [`StreamItem`]s for one stream epoch
///
/// Blocking consumers wait on a condition variable, async consumers on a
/// [`Notify`]. Once a terminal item is queued further pushes are refused.
#[derive(Debug)]
pub struct StreamQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    notify: Notify,
}

impl Default for StreamQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamQueue {
    /// Create an active, empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: FastQueue::new(),
                finished: false,
                active: true,
            }),
            ready: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Queue an item; returns `false` if the queue is finished or inactive
    pub fn push(&self, item: StreamItem) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.finished || !inner.active {
                return false;
            }
            inner.finished = item.is_terminal();
            inner.items.push(item);
        }
        self.wake();
        true
    }

    /// Stop the queue; waiting consumers return with no item
    pub fn deactivate(&self) {
        self.inner.lock().active = false;
        self.wake();
    }

    /// Whether the queue still accepts and yields items
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Whether a terminal item has been queued
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no item is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block the calling thread until an item is available
    ///
    /// Returns `None` when the queue is drained and either finished or
    /// inactive. The emptiness test is repeated under the lock after every
    /// wakeup so a push between test and wait cannot be missed.
    pub fn pop_blocking(&self) -> Option<StreamItem> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.active {
                return None;
            }
            if let Some(item) = inner.items.pop() {
                return Some(item);
            }
            if inner.finished {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Wait asynchronously until an item is available
    ///
    /// Same contract as [`pop_blocking`](Self::pop_blocking).
    pub async fn pop(&self) -> Option<StreamItem> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if !inner.active {
                    return None;
                }
                if let Some(item) = inner.items.pop() {
                    return Some(item);
                }
                if inner.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn wake(&self) {
        self.ready.notify_all();
        self.notify.notify_waiters();
    }
}
