//! Workflow run type definitions
//!
//! Run states, the event codes the server sends, and the typed events the
//! workflow state machine hands to subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::connection::ConnectionState;
use crate::error::ChatFlowError;
use crate::message::ResponseEnvelope;

// ============================================================================
// Run State
// ============================================================================

/// State of a workflow run
///
/// Runs move `Idle → Starting → Running → (Waiting ⇄ Running)* →
/// {Completed | Error | Aborted}` and never leave a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Not started
    Idle,
    /// Start request sent, start event not yet seen
    Starting,
    /// Server is executing the flow
    Running,
    /// Flow is waiting for user input
    Waiting,
    /// Flow finished normally
    Completed,
    /// Flow failed
    Error,
    /// Flow was aborted locally or blocked by the server
    Aborted,
}

impl FlowState {
    /// Whether no further transitions or events can happen
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// Whether `self → next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Self::Error | Self::Aborted) => true,
            (Self::Idle, Self::Starting | Self::Running) => true,
            (Self::Starting, Self::Running) => true,
            (Self::Running, Self::Waiting | Self::Completed) => true,
            (Self::Waiting, Self::Running | Self::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Event Codes
// ============================================================================

/// Event code carried in the `event` field of a workflow frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEventCode {
    /// Run started
    Start,
    /// A node is waiting for input
    Waiting,
    /// Run finished
    End,
    /// Execution entered a node
    NodeEnter,
    /// Diagnostic output
    Debug,
    /// Execution jumped to another node
    Jump,
    /// Generic success frame, usually carrying display text
    Success,
    /// Server-side failure
    Error,
}

impl FlowEventCode {
    /// Parse the wire representation
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "flow_start" => Some(Self::Start),
            "flow_waiting" => Some(Self::Waiting),
            "flow_end" => Some(Self::End),
            "node_enter" => Some(Self::NodeEnter),
            "debug" => Some(Self::Debug),
            "jump" => Some(Self::Jump),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "flow_start",
            Self::Waiting => "flow_waiting",
            Self::End => "flow_end",
            Self::NodeEnter => "node_enter",
            Self::Debug => "debug",
            Self::Jump => "jump",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Kind of a [`FlowEvent`], used as the handler dispatch key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEventType {
    /// Run started
    Start,
    /// Display text chunk
    Message,
    /// Waiting for input
    Waiting,
    /// Run completed
    End,
    /// Run failed
    Error,
    /// Diagnostic output
    Debug,
    /// Node entered
    NodeEnter,
    /// Jump between nodes
    Jump,
    /// Outbound envelope as sent
    RawRequest,
    /// Inbound envelope as received
    RawResponse,
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Connection being re-established
    Reconnecting,
}

/// Node metadata shared by several events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Flow name
    pub flow_name: Option<String>,
    /// Node title
    pub node_title: Option<String>,
    /// Node type
    pub node_type: Option<String>,
    /// Current node id
    pub cur_node_id: Option<String>,
    /// Parent node id
    pub parent_node_id: Option<String>,
}

impl NodeInfo {
    /// Extract node metadata from an envelope
    #[must_use]
    pub fn from_envelope(envelope: &ResponseEnvelope) -> Self {
        Self {
            flow_name: envelope.flow_name.clone(),
            node_title: envelope.node_title.clone(),
            node_type: envelope.node_type.clone(),
            cur_node_id: envelope.cur_node_id.clone(),
            parent_node_id: envelope.parent_node_id.clone(),
        }
    }
}

/// Payload of a start event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStart {
    /// Node metadata
    pub node: NodeInfo,
    /// Dialog id, when supplied
    pub dialog_id: Option<String>,
}

/// Payload of a message event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowMessage {
    /// Display text
    pub text: String,
    /// Node metadata
    pub node: NodeInfo,
    /// Whether the server marked this frame as the last of its answer
    pub finished: bool,
}

/// Payload of a waiting-for-input event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowWaiting {
    /// Prompt shown to the user
    pub text: String,
    /// Node metadata
    pub node: NodeInfo,
    /// Variables exposed by the waiting node
    pub variables: HashMap<String, Value>,
}

/// Payload of an end event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEnd {
    /// Final answer text
    pub text: String,
    /// Node metadata
    pub node: NodeInfo,
    /// Output variables
    pub variables: HashMap<String, Value>,
}

/// Payload of an error event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFailure {
    /// The error
    pub error: ChatFlowError,
    /// Node metadata, when the failure came from a frame
    pub node: NodeInfo,
}

/// Payload of a debug event
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDebug {
    /// Diagnostic text
    pub text: String,
    /// Node metadata
    pub node: NodeInfo,
    /// Raw diagnostic payload
    pub data: Value,
}

/// Event emitted by a workflow run
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    /// Run started
    Start(FlowStart),
    /// Display text chunk
    Message(FlowMessage),
    /// Waiting for input
    Waiting(FlowWaiting),
    /// Run completed
    End(FlowEnd),
    /// Run failed
    Error(FlowFailure),
    /// Diagnostic output
    Debug(FlowDebug),
    /// Node entered
    NodeEnter(NodeInfo),
    /// Jump between nodes
    Jump(NodeInfo),
    /// Outbound envelope as sent
    RawRequest(Value),
    /// Inbound envelope as received
    RawResponse(Box<ResponseEnvelope>),
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Connection being re-established
    Reconnecting,
}

impl FlowEvent {
    /// Kind of this event
    #[must_use]
    pub const fn event_type(&self) -> FlowEventType {
        match self {
            Self::Start(_) => FlowEventType::Start,
            Self::Message(_) => FlowEventType::Message,
            Self::Waiting(_) => FlowEventType::Waiting,
            Self::End(_) => FlowEventType::End,
            Self::Error(_) => FlowEventType::Error,
            Self::Debug(_) => FlowEventType::Debug,
            Self::NodeEnter(_) => FlowEventType::NodeEnter,
            Self::Jump(_) => FlowEventType::Jump,
            Self::RawRequest(_) => FlowEventType::RawRequest,
            Self::RawResponse(_) => FlowEventType::RawResponse,
            Self::Connected => FlowEventType::Connected,
            Self::Disconnected => FlowEventType::Disconnected,
            Self::Reconnecting => FlowEventType::Reconnecting,
        }
    }

    /// Connection event matching a connection state, if any
    #[must_use]
    pub const fn from_connection_state(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Connected => Some(Self::Connected),
            ConnectionState::Disconnected | ConnectionState::Closed => Some(Self::Disconnected),
            ConnectionState::Reconnecting => Some(Self::Reconnecting),
            ConnectionState::Connecting | ConnectionState::NotExist => None,
        }
    }
}

/// Final outcome of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutcome {
    /// Final answer text
    pub text: String,
    /// Output variables
    pub variables: HashMap<String, Value>,
}
