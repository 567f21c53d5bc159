//! # ChatFlow client for Rust
//!
//! Async client runtime for a chat and workflow service spoken over
//! WebSocket: idempotent connects with heartbeats and automatic
//! reconnection, streamed and single-shot chat answers per session, and an
//! event-driven state machine for multi-step workflow runs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chatflow_client::{ChatClient, ChatRequest, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::builder("wss://chat.example.com/ws")
//!         .key("api-key")
//!         .username("alice")
//!         .build()?;
//!     let client = ChatClient::new(config)?;
//!
//!     let answer = client.send(ChatRequest::new().prompt("What is 2 + 2?")).await?;
//!     log::info!("answer: {}", answer.text);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Features
//!
//! ### 1. Streaming answers with [`ChatClient::stream`]
//!
//! A [`ChatStream`] yields answer chunks as they arrive. It can be consumed
//! as a blocking iterator (from a plain thread) or converted into a
//! `futures::Stream`, and its [`done`](ChatStream::done) future resolves to
//! the full [`ChatAnswer`] either way.
//!
//! ```no_run
//! # use chatflow_client::{ChatClient, ChatRequest};
//! # async fn example(client: ChatClient) -> chatflow_client::Result<()> {
//! let stream = client.stream(ChatRequest::new().prompt("hello").session("s1")).await?;
//! let answer = tokio::task::spawn_blocking(move || {
//!     let done = stream.done();
//!     for chunk in stream {
//!         print!("{}", chunk?);
//!     }
//!     Ok::<_, chatflow_client::ChatFlowError>(done)
//! })
//! .await
//! .map_err(|e| chatflow_client::ChatFlowError::unknown(e.to_string()))??
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### 2. Workflow runs with [`FlowClient`]
//!
//! Subscribe to typed events, start a run and answer nodes that wait for
//! input. See the [`flow`] module.
//!
//! ### 3. Connections and registries
//!
//! [`Connection`] is usable on its own; [`MultiSessionRegistry`] and
//! [`SingleConnectionRegistry`] map session ids to connections. Any
//! [`Connector`] can stand in for the WebSocket transport, e.g. the
//! in-process [`MemoryConnector`].
//!
//! ## Feature Flags
//!
//! - `http` - Enables [`history::HistoryClient`] for paginated history lookups (requires `reqwest`)
//!
//! ## Logging
//!
//! The crate logs through the `log` facade with the session id as a
//! `[session]` prefix. Install any `log` implementation to see the output.

#![recursion_limit = "256"]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod error;
pub mod flow;
#[cfg(feature = "http")]
pub mod history;
pub mod hooks;
pub mod message;
pub mod registry;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export main types
pub use client::{ChatClient, ChatRequest, SessionState};
pub use connection::{ConnectFuture, Connection, ConnectionState, ListenerId, ReconnectPolicy};
pub use error::{ChatFlowError, Result};
pub use flow::{FlowClient, FlowCompletion};
pub use hooks::{FlowHandler, HandlerId, HandlerRegistry};
pub use message::{FlowRequest, RequestEnvelope, ResponseEnvelope, Signal, parse_frame};
pub use registry::{ConnectionRegistry, MultiSessionRegistry, SHUTDOWN_GRACE, SingleConnectionRegistry};
pub use stream::{AnswerFuture, ChatStream, FastQueue, StreamItem, StreamQueue};
pub use transport::{Connector, MemoryConnector, MemoryServer, WebSocketConnector};

// Re-export types
pub use types::config::{ClientConfig, ClientConfigBuilder};
pub use types::flow::{
    FlowDebug, FlowEnd, FlowEvent, FlowEventCode, FlowEventType, FlowFailure, FlowMessage,
    FlowOutcome, FlowStart, FlowState, FlowWaiting, NodeInfo,
};
pub use types::identifiers::{DialogId, SessionId};
pub use types::messages::{ChatAnswer, ChatMessage, HistoryEntry, Role, SideContent, SideContentKind};
pub use types::options::{ChatOptions, ChatOptionsBuilder};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
