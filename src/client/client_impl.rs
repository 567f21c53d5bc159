//! `ChatClient` implementation
//!
//! Constructors and the public API. Inbound processing and timers live in
//! `tasks.rs`.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use super::session::{Session, SessionState};
use super::{Callbacks, ChatRequest, ClientInner};
use crate::error::{ChatFlowError, Result};
use crate::message::RequestEnvelope;
use crate::registry::{ConnectionRegistry, MultiSessionRegistry, SHUTDOWN_GRACE};
use crate::stream::{AnswerFuture, ChatStream, StreamQueue};
use crate::transport::{Connector, WebSocketConnector};
use crate::types::config::ClientConfig;
use crate::types::identifiers::SessionId;
use crate::types::messages::{ChatAnswer, HistoryEntry, SideContent};
use crate::types::options::ChatOptions;

impl super::ChatClient {
    /// Create a client that connects over WebSocket
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Create a client with a custom connector
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(MultiSessionRegistry::new(Arc::clone(&config), connector));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                sessions: Mutex::new(HashMap::new()),
                active_streams: Mutex::new(HashMap::new()),
                callbacks: RwLock::new(Callbacks::default()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Send a request and wait for the aggregated answer
    ///
    /// # Errors
    /// - `RequestInProgress` if the session already has a request in flight
    /// - `ConnectionFailed` / `ConnectionTimeout` if the connection cannot be established
    /// - `SendFailed` if the frame cannot be written
    /// - `ServerError` if the server answers with a non-success code
    /// - `ResponseTimeout` if no chunk arrives within the response timeout
    pub async fn send(&self, request: impl Into<ChatRequest>) -> Result<ChatAnswer> {
        let (_, answer, _) = self.begin(request.into(), false).await?;
        answer
            .await
            .unwrap_or_else(|_| Err(ChatFlowError::session("request was abandoned")))
    }

    /// Send a request and stream the answer
    ///
    /// # Errors
    /// Same setup errors as [`send`](Self::send); errors arriving later are
    /// delivered through the stream
    pub async fn stream(&self, request: impl Into<ChatRequest>) -> Result<ChatStream> {
        let request = request.into();
        let session_id = request.session_id().clone();
        let (session, answer, stream) = self.begin(request, true).await?;
        let Some((queue, stream_id)) = stream else {
            return Err(ChatFlowError::session("stream queue missing"));
        };
        self.inner
            .active_streams
            .lock()
            .insert(session_id.clone(), Arc::clone(&queue));

        let done: AnswerFuture = async move {
            answer
                .await
                .unwrap_or_else(|_| Err(ChatFlowError::session("request was abandoned")))
        }
        .boxed()
        .shared();

        let weak_inner: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let weak_session = Arc::downgrade(&session);
        let own_queue = Arc::clone(&queue);
        Ok(ChatStream::new(queue, done, move || {
            if let Some(inner) = weak_inner.upgrade() {
                let mut active = inner.active_streams.lock();
                // A newer stream may have replaced this one
                if active
                    .get(&session_id)
                    .is_some_and(|queue| Arc::ptr_eq(queue, &own_queue))
                {
                    active.remove(&session_id);
                }
            }
            if let Some(session) = weak_session.upgrade() {
                let mut st = session.state.lock();
                if st.stream_id == stream_id {
                    st.queue = None;
                }
            }
        }))
    }

    /// Establish the session's connection
    ///
    /// # Errors
    /// Returns the connection error if the handshake fails
    pub async fn connect(&self, session_id: impl Into<SessionId>) -> Result<()> {
        let session_id = session_id.into();
        self.ensure_connected(&session_id).await.map(|_| ())
    }

    /// Whether the session's connection is established
    #[must_use]
    pub fn is_connected(&self, session_id: impl Into<SessionId>) -> bool {
        self.inner.registry.is_connected(&session_id.into())
    }

    /// Conversation history of a session, oldest first
    ///
    /// Empty for unknown and disconnected sessions.
    #[must_use]
    pub fn history(&self, session_id: impl Into<SessionId>) -> Vec<HistoryEntry> {
        self.inner
            .sessions
            .lock()
            .get(&session_id.into())
            .map(|s| s.state.lock().history.clone())
            .unwrap_or_default()
    }

    /// Default options for every request of a session
    pub fn set_session_options(&self, session_id: impl Into<SessionId>, options: ChatOptions) {
        let session = self.inner.session(&session_id.into());
        session.state.lock().options = options;
    }

    /// Coarse state of a session; `Idle` for unknown sessions
    #[must_use]
    pub fn session_state(&self, session_id: impl Into<SessionId>) -> SessionState {
        self.inner
            .sessions
            .lock()
            .get(&session_id.into())
            .map_or(SessionState::Idle, |s| s.state.lock().session_state)
    }

    /// When the session's last request completed successfully
    #[must_use]
    pub fn last_completed(&self, session_id: impl Into<SessionId>) -> Option<DateTime<Utc>> {
        self.inner
            .sessions
            .lock()
            .get(&session_id.into())
            .and_then(|s| s.state.lock().last_completed)
    }

    /// Whether a stream consumer is attached to the session
    #[must_use]
    pub fn has_active_stream(&self, session_id: impl Into<SessionId>) -> bool {
        self.inner.active_streams.lock().contains_key(&session_id.into())
    }

    /// Close a session's connection and discard the session
    ///
    /// A request in flight fails with `ConnectionClosed`. History and
    /// session options are dropped; the next request starts a fresh session
    /// on a new connection.
    pub fn disconnect(&self, session_id: impl Into<SessionId>) {
        let session_id = session_id.into();
        log::debug!("[{session_id}] disconnecting");
        let session = self.inner.sessions.lock().remove(&session_id);
        if let Some(session) = &session {
            session.state.lock().cancel_timer();
        }
        self.inner.registry.disconnect(&session_id);
        if let Some(session) = session {
            self.inner.fail_request(
                &session,
                ChatFlowError::connection_closed("session disconnected"),
            );
            session.state.lock().session_state = SessionState::Closed;
        }
        self.inner.active_streams.lock().remove(&session_id);
    }

    /// Shut the client down
    ///
    /// Cancels every session timer, disconnects every session, then shuts
    /// the registry down, waiting up to [`SHUTDOWN_GRACE`] for connection
    /// tasks. Further requests fail with `SessionError`.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        for session in &sessions {
            session.state.lock().cancel_timer();
        }
        for session in &sessions {
            self.disconnect(session.id.clone());
        }
        self.inner.registry.shutdown(SHUTDOWN_GRACE).await;
        log::info!("chat client shut down ({} session(s))", sessions.len());
    }

    /// Callback for reasoning text; replaces any previous one
    pub fn on_reasoning(&self, callback: impl Fn(&SessionId, &str) + Send + Sync + 'static) {
        self.inner.callbacks.write().reasoning = Some(Arc::new(callback));
    }

    /// Callback for search results and image references; replaces any previous one
    pub fn on_content(&self, callback: impl Fn(&SessionId, &SideContent) + Send + Sync + 'static) {
        self.inner.callbacks.write().content = Some(Arc::new(callback));
    }

    /// Callback for request failures; replaces any previous one
    pub fn on_error(&self, callback: impl Fn(&SessionId, &ChatFlowError) + Send + Sync + 'static) {
        self.inner.callbacks.write().error = Some(Arc::new(callback));
    }

    async fn ensure_connected(&self, session_id: &SessionId) -> Result<Arc<Session>> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ChatFlowError::session("client has been shut down"));
        }
        let session = self.inner.session(session_id);
        let connection = self.inner.registry.get(session_id)?;
        self.inner.attach(&session, &connection);
        connection.connect().await?;
        {
            let mut st = session.state.lock();
            if matches!(st.session_state, SessionState::Idle | SessionState::Closed) {
                st.session_state = SessionState::Connected;
            }
        }
        Ok(session)
    }

    /// Connect, claim the session and send the request envelope
    async fn begin(
        &self,
        request: ChatRequest,
        stream: bool,
    ) -> Result<Begun> {
        let session_id = request.session_id().clone();
        let session = self.ensure_connected(&session_id).await?;
        let connection = self.inner.registry.get(&session_id)?;

        let (tx, rx) = oneshot::channel();
        let (envelope, queue) = {
            let mut st = session.state.lock();
            if st.sending {
                return Err(ChatFlowError::request_in_progress(session_id.as_str()));
            }

            let options = request
                .options()
                .merged_over(&st.options.merged_over(&self.inner.config.default_options));
            let envelope = RequestEnvelope::chat(
                &self.inner.config,
                &session_id,
                request.prompt_text(),
                request.message_list(),
                &options,
            )?;

            st.sending = true;
            st.buffer.clear();
            st.message_id = None;
            st.question.clone_from(&envelope.question);
            st.stream_mode = stream;
            st.session_state = SessionState::Waiting;
            st.pending = Some(tx);
            let queue = stream.then(|| {
                st.stream_id += 1;
                let queue = Arc::new(StreamQueue::new());
                st.queue = Some(Arc::clone(&queue));
                (queue, st.stream_id)
            });
            self.inner.arm_timeout(&session, &mut st);
            (envelope, queue)
        };

        log::debug!(
            "[{session_id}] sending request ({} mode)",
            if stream { "stream" } else { "single-shot" }
        );
        if let Err(err) = connection.send(&envelope) {
            let (pending, queue) = session.state.lock().reset_request();
            drop(pending);
            if let Some(queue) = queue {
                queue.deactivate();
            }
            return Err(err);
        }
        Ok((session, rx, queue))
    }
}

/// Claimed session, result slot and, for streamed requests, the queue and its epoch
type Begun = (
    Arc<Session>,
    oneshot::Receiver<Result<ChatAnswer>>,
    Option<(Arc<StreamQueue>, u64)>,
);

impl ClientInner {
    /// Session record for `id`, created on first use
    pub(super) fn session(&self, id: &SessionId) -> Arc<Session> {
        Arc::clone(
            self.sessions
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Session::new(id.clone()))),
        )
    }
}
