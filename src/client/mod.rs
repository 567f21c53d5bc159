//! `ChatClient` for streamed and single-shot chat requests
//!
//! Each session id owns one connection (through a
//! [`MultiSessionRegistry`](crate::registry::MultiSessionRegistry)) and one
//! coordination record. Inbound frames are classified on the connection's
//! reader task and either appended to the answer, routed to a callback or
//! used to finish the request.
//!
//! # Architecture
//!
//! ```text
//!  caller ── send()/stream() ──▶ Session (mutex: sending flag, buffer, timer)
//!                                   │  envelope
//!                                   ▼
//!                               Connection ──▶ socket
//!                                   │  on_message (reader task)
//!                                   ▼
//!             classify ─▶ chunk ─▶ StreamQueue ─▶ ChatStream (has_next / async)
//!                      ─▶ finish ─▶ history + terminal item + oneshot result
//!                      ─▶ error / timeout ─▶ error callback + error item
//! ```
//!
//! # Example: Single-shot
//!
//! ```no_run
//! use chatflow_client::{ChatClient, ChatRequest, ClientConfig};
//!
//! # async fn example() -> chatflow_client::Result<()> {
//! let config = ClientConfig::builder("wss://chat.example.com/ws").key("k").build()?;
//! let client = ChatClient::new(config)?;
//! let answer = client.send(ChatRequest::new().prompt("hello").session("s1")).await?;
//! log::info!("{} (dialog {:?})", answer.text, answer.dialog_id);
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Streaming
//!
//! ```no_run
//! use futures::StreamExt;
//! use chatflow_client::{ChatClient, ChatRequest, ClientConfig};
//!
//! # async fn example() -> chatflow_client::Result<()> {
//! let client = ChatClient::new(ClientConfig::from_env()?)?;
//! let stream = client.stream(ChatRequest::new().prompt("tell me a story")).await?;
//! let done = stream.done();
//! let mut chunks = Box::pin(stream.into_async());
//! while let Some(chunk) = chunks.next().await {
//!     print!("{}", chunk?);
//! }
//! let answer = done.await?;
//! # Ok(())
//! # }
//! ```

mod client_impl;
mod session;
mod tasks;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::registry::ConnectionRegistry;
use crate::stream::StreamQueue;
use crate::types::config::ClientConfig;
use crate::types::identifiers::SessionId;
use crate::types::messages::{ChatMessage, SideContent};
use crate::types::options::ChatOptions;
use crate::error::ChatFlowError;

pub use session::SessionState;

use session::Session;

/// Callback receiving reasoning text
pub type ReasoningCallback = Arc<dyn Fn(&SessionId, &str) + Send + Sync>;

/// Callback receiving out-of-band content
pub type ContentCallback = Arc<dyn Fn(&SessionId, &SideContent) + Send + Sync>;

/// Callback receiving request failures
pub type ErrorCallback = Arc<dyn Fn(&SessionId, &ChatFlowError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    reasoning: Option<ReasoningCallback>,
    content: Option<ContentCallback>,
    error: Option<ErrorCallback>,
}

pub(crate) struct ClientInner {
    config: Arc<ClientConfig>,
    registry: Arc<dyn ConnectionRegistry>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Queue of the stream currently attached to each session
    active_streams: Mutex<HashMap<SessionId, Arc<StreamQueue>>>,
    callbacks: RwLock<Callbacks>,
    shut_down: AtomicBool,
}

/// Chat client managing one connection per session
///
/// Cloning is cheap; clones share sessions and connections.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

/// One chat request
///
/// ```
/// use chatflow_client::{ChatMessage, ChatOptions, ChatRequest};
///
/// let request = ChatRequest::new()
///     .session("s1")
///     .messages(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")])
///     .option(ChatOptions::builder().temperature(0.2).build());
/// assert_eq!(request.session_id().as_str(), "s1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    prompt: Option<String>,
    messages: Option<Vec<ChatMessage>>,
    options: ChatOptions,
    session: SessionId,
}

impl ChatRequest {
    /// Empty request for the default session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Question text
    #[must_use]
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Request-level options, merged over the session's and the config's
    #[must_use]
    pub fn option(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// Target session
    #[must_use]
    pub fn session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = session.into();
        self
    }

    /// Structured message list; the last user message becomes the question
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Target session id
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Prompt text, if set
    #[must_use]
    pub fn prompt_text(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    /// Structured messages, if set
    #[must_use]
    pub fn message_list(&self) -> Option<&[ChatMessage]> {
        self.messages.as_deref()
    }

    /// Request-level options
    #[must_use]
    pub fn options(&self) -> &ChatOptions {
        &self.options
    }
}

impl From<&str> for ChatRequest {
    fn from(prompt: &str) -> Self {
        Self::new().prompt(prompt)
    }
}

impl From<String> for ChatRequest {
    fn from(prompt: String) -> Self {
        Self::new().prompt(prompt)
    }
}
