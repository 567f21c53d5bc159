//! Type definitions shared across the client
//!
//! - [`identifiers`] - Type-safe ID wrappers (`SessionId`, `DialogId`)
//! - [`messages`] - Chat messages, history entries and answers
//! - [`options`] - Per-request model options
//! - [`config`] - Client configuration and reconnect policy
//! - [`flow`] - Workflow run states and events

pub mod config;
pub mod flow;
pub mod identifiers;
pub mod messages;
pub mod options;

// Re-export commonly used types
pub use config::{ClientConfig, ReconnectPolicy};
pub use identifiers::{DialogId, SessionId};
pub use messages::{ChatAnswer, ChatMessage, HistoryEntry, Role};
pub use options::ChatOptions;
