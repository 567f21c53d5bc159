//! Connection lifecycle management
//!
//! A [`Connection`] owns one physical link for one logical session id and
//! takes care of:
//! - idempotent connects (concurrent callers share one handshake)
//! - the heartbeat loop
//! - reconnection with capped exponential backoff after an established
//!   link drops
//! - fan-out of decoded inbound frames, state changes and errors to
//!   registered listeners
//!
//! ```text
//!  Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                  │ link dropped
//!       └──────────failed────────┘                  ▼
//!       ◀──────attempts exhausted────────── Reconnecting ──ok──▶ Connected
//!
//!  any state ──close──▶ Closed (terminal)
//! ```

mod lifecycle;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatFlowError, Result};
use crate::message::{RequestEnvelope, ResponseEnvelope};
use crate::transport::{Connector, OutboundFrame};
use crate::types::config::ClientConfig;
use crate::types::identifiers::SessionId;

pub use crate::types::config::ReconnectPolicy;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link, not trying
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Link established
    Connected,
    /// Waiting for or performing a reconnect attempt
    Reconnecting,
    /// Explicitly closed; terminal
    Closed,
    /// No connection exists for the requested id
    NotExist,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::NotExist => "not_exist",
        };
        f.write_str(name)
    }
}

/// Shared result of one connect attempt
pub type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Listener for decoded inbound frames (heartbeats are never delivered)
pub type MessageListener = Arc<dyn Fn(&ResponseEnvelope) + Send + Sync>;

/// Listener for connection state changes
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Listener for connection-level errors
pub type ErrorListener = Arc<dyn Fn(&ChatFlowError) + Send + Sync>;

/// Handle returned by listener registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    message: Vec<(ListenerId, MessageListener)>,
    state: Vec<(ListenerId, StateListener)>,
    error: Vec<(ListenerId, ErrorListener)>,
}

/// Mutable connection state, guarded by one mutex
struct Core {
    state: ConnectionState,
    /// Connect attempt in flight, shared by every caller
    pending: Option<ConnectFuture>,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    /// Cancels the reader and heartbeat tasks of the current link
    link_token: Option<CancellationToken>,
    /// Cancels the reconnect loop
    reconnect_token: Option<CancellationToken>,
    /// Incremented per established link; stale close events are ignored
    generation: u64,
    /// Reader, heartbeat and reconnect tasks, awaited on shutdown
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(handle);
    }
}

pub(crate) struct Inner {
    session_id: SessionId,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    core: Mutex<Core>,
    attempts: AtomicU32,
    next_listener_id: AtomicU64,
    listeners: RwLock<Listeners>,
}

/// One physical connection for one logical session
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Weak handle to a [`Connection`]
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    /// Upgrade to a strong handle if the connection still exists
    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Connection {
    /// Create a disconnected connection for `session_id`
    #[must_use]
    pub fn new(session_id: SessionId, config: Arc<ClientConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session_id,
                config,
                connector,
                core: Mutex::new(Core {
                    state: ConnectionState::Disconnected,
                    pending: None,
                    outbound: None,
                    link_token: None,
                    reconnect_token: None,
                    generation: 0,
                    tasks: Vec::new(),
                }),
                attempts: AtomicU32::new(0),
                next_listener_id: AtomicU64::new(1),
                listeners: RwLock::new(Listeners::default()),
            }),
        }
    }

    /// Session id this connection serves
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Whether the link is established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts since the link was last established
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Weak handle to this connection
    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles refer to the same connection
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Establish the link
    ///
    /// Resolves immediately when already connected. While a handshake is in
    /// flight every caller receives the same shared future, so N concurrent
    /// calls perform exactly one physical handshake. The handshake runs in
    /// its own task and completes even if every caller stops polling.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// The future fails with `ConnectionFailed` (bad URL, transport error,
    /// rejected upgrade), `ConnectionTimeout` (handshake timeout) or
    /// `ConnectionClosed` (connection was closed)
    pub fn connect(&self) -> ConnectFuture {
        self.begin_connect(false)
    }

    /// Send a request envelope
    ///
    /// # Errors
    /// Returns `SendFailed` if the connection is not established or the
    /// frame cannot be queued, `RequestFailed` if encoding fails
    pub fn send(&self, envelope: &RequestEnvelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        self.send_text(frame)
    }

    /// Send a raw text frame
    ///
    /// # Errors
    /// Returns `SendFailed` if the connection is not established or the
    /// frame cannot be queued
    pub fn send_text(&self, frame: impl Into<String>) -> Result<()> {
        let core = self.inner.core.lock();
        if core.state != ConnectionState::Connected {
            return Err(ChatFlowError::send_failed(format!(
                "connection for session {} is {}",
                self.inner.session_id, core.state
            )));
        }
        let outbound = core
            .outbound
            .as_ref()
            .ok_or_else(|| ChatFlowError::send_failed("link not available"))?;
        outbound
            .send(OutboundFrame::Text(frame.into()))
            .map_err(|_| ChatFlowError::send_failed("link writer has stopped"))
    }

    /// Close the connection for good
    ///
    /// Cancels heartbeat, reader and reconnect tasks, closes the socket,
    /// notifies state listeners of `Closed` and then unregisters every
    /// listener. Idempotent.
    pub fn close(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.state == ConnectionState::Closed {
                return;
            }
            core.state = ConnectionState::Closed;
            core.pending = None;
            if let Some(token) = core.link_token.take() {
                token.cancel();
            }
            if let Some(token) = core.reconnect_token.take() {
                token.cancel();
            }
            if let Some(outbound) = core.outbound.take() {
                let _ = outbound.send(OutboundFrame::Close);
            }
        }
        log::debug!("[{}] connection closed", self.inner.session_id);
        self.inner.notify_state(ConnectionState::Closed);
        self.clear_listeners();
    }

    /// Close the connection and wait up to `grace` for its tasks to stop
    ///
    /// Tasks still running after the grace period are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        let tasks = std::mem::take(&mut self.inner.core.lock().tasks);
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            log::warn!(
                "[{}] connection tasks still running after {} ms, aborting",
                self.inner.session_id,
                grace.as_millis()
            );
            for handle in aborts {
                handle.abort();
            }
        }
    }

    /// Register a listener for decoded inbound frames
    pub fn on_message(&self, listener: impl Fn(&ResponseEnvelope) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_id();
        self.inner.listeners.write().message.push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for state changes
    pub fn on_state_change(&self, listener: impl Fn(ConnectionState) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_id();
        self.inner.listeners.write().state.push((id, Arc::new(listener)));
        id
    }

    /// Register a listener for connection-level errors
    pub fn on_error(&self, listener: impl Fn(&ChatFlowError) + Send + Sync + 'static) -> ListenerId {
        let id = self.inner.next_id();
        self.inner.listeners.write().error.push((id, Arc::new(listener)));
        id
    }

    /// Unregister one listener
    pub fn remove_listener(&self, id: ListenerId) {
        let mut listeners = self.inner.listeners.write();
        listeners.message.retain(|(lid, _)| *lid != id);
        listeners.state.retain(|(lid, _)| *lid != id);
        listeners.error.retain(|(lid, _)| *lid != id);
    }

    /// Unregister every listener
    pub fn clear_listeners(&self) {
        *self.inner.listeners.write() = Listeners::default();
    }
}

impl Inner {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Deliver a frame to every message listener; a panicking listener is
    /// reported as an `Unknown` error and does not stop delivery
    fn notify_message(&self, envelope: &ResponseEnvelope) {
        let listeners: Vec<MessageListener> = self
            .listeners
            .read()
            .message
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(envelope))) {
                let err = ChatFlowError::from_panic(payload.as_ref());
                log::error!("[{}] message listener panicked: {err}", self.session_id);
                self.notify_error(&err);
            }
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        let listeners: Vec<StateListener> = self
            .listeners
            .read()
            .state
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                log::error!("[{}] state listener panicked", self.session_id);
            }
        }
    }

    fn notify_error(&self, error: &ChatFlowError) {
        let listeners: Vec<ErrorListener> = self
            .listeners
            .read()
            .error
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(error))).is_err() {
                log::error!("[{}] error listener panicked", self.session_id);
            }
        }
    }
}

pub(crate) fn ready_future(result: Result<()>) -> ConnectFuture {
    futures::future::ready(result).boxed().shared()
}
