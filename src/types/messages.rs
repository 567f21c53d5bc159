//! Message-related type definitions
//!
//! Structured chat messages (role + content) as sent in the outbound
//! envelope, and the per-session conversation history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::DialogId;

// ============================================================================
// Message Types
// ============================================================================

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction
    System,
    /// End user
    User,
    /// Model answer
    Assistant,
}

/// Structured chat message (OpenAI-style role/content)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: Role,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a message with the given role
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One turn of a session's conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Who said it
    pub role: Role,
    /// What was said
    pub content: String,
    /// Dialog id of the exchange, when the server supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_id: Option<DialogId>,
    /// When the entry was recorded
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Create a history entry stamped with the current time
    pub fn new(role: Role, content: impl Into<String>, dialog_id: Option<DialogId>) -> Self {
        Self {
            role,
            content: content.into(),
            dialog_id,
            at: Utc::now(),
        }
    }
}

// ============================================================================
// Answers
// ============================================================================

/// Aggregated answer to one chat request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAnswer {
    /// Full answer text
    pub text: String,
    /// Dialog id assigned by the server
    pub dialog_id: Option<DialogId>,
    /// Message id assigned by the server
    pub message_id: Option<String>,
}

/// Kind of out-of-band content delivered next to an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideContentKind {
    /// Online search results
    OnlineSearch,
    /// Image references
    ImageReference,
}

/// Out-of-band content (search results, image references)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideContent {
    /// What the payload is
    pub kind: SideContentKind,
    /// Raw payload as sent by the server
    pub data: serde_json::Value,
}
