//! Per-session coordination state

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::WeakConnection;
use crate::error::Result;
use crate::stream::StreamQueue;
use crate::types::identifiers::SessionId;
use crate::types::messages::{ChatAnswer, HistoryEntry};
use crate::types::options::ChatOptions;

/// Coarse state of a chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Never connected
    Idle,
    /// Connected, no request in flight
    Connected,
    /// Answer chunks are arriving
    Chatting,
    /// Request sent, no chunk received yet
    Waiting,
    /// Session was disconnected
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Chatting => "chatting",
            Self::Waiting => "waiting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Mutable state of one session, guarded by the session mutex
///
/// At most one request is in flight: `sending` is tested and set under the
/// same lock that guards the buffer.
pub(crate) struct StreamState {
    pub(crate) session_state: SessionState,
    pub(crate) sending: bool,
    pub(crate) last_completed: Option<DateTime<Utc>>,
    pub(crate) buffer: String,
    pub(crate) question: String,
    pub(crate) dialog_id: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) stream_mode: bool,
    /// Epoch of the active stream, bumped per streamed request
    pub(crate) stream_id: u64,
    pub(crate) queue: Option<Arc<StreamQueue>>,
    pub(crate) pending: Option<oneshot::Sender<Result<ChatAnswer>>>,
    /// Epoch of the armed response timer; older timers are ignored
    pub(crate) timer_epoch: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
    pub(crate) options: ChatOptions,
    pub(crate) history: Vec<HistoryEntry>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            session_state: SessionState::Idle,
            sending: false,
            last_completed: None,
            buffer: String::new(),
            question: String::new(),
            dialog_id: None,
            message_id: None,
            stream_mode: false,
            stream_id: 0,
            queue: None,
            pending: None,
            timer_epoch: 0,
            timer: None,
            options: ChatOptions::default(),
            history: Vec::new(),
        }
    }

    /// Invalidate and stop the response timer
    pub(crate) fn cancel_timer(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Clear every per-request field
    ///
    /// Returns the pending result slot and stream queue so the caller can
    /// resolve them after releasing the lock.
    pub(crate) fn reset_request(
        &mut self,
    ) -> (
        Option<oneshot::Sender<Result<ChatAnswer>>>,
        Option<Arc<StreamQueue>>,
    ) {
        self.cancel_timer();
        self.sending = false;
        self.stream_mode = false;
        self.buffer.clear();
        self.question.clear();
        self.message_id = None;
        if matches!(self.session_state, SessionState::Chatting | SessionState::Waiting) {
            self.session_state = SessionState::Connected;
        }
        (self.pending.take(), self.queue.take())
    }
}

/// One chat session
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: Mutex<StreamState>,
    /// Connection the inbound listeners are attached to
    pub(crate) attached: Mutex<WeakConnection>,
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState::new()),
            attached: Mutex::new(WeakConnection::default()),
        }
    }
}
