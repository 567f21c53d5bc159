//! Outbound request envelope construction

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ChatFlowError, Result};
use crate::types::config::ClientConfig;
use crate::types::identifiers::SessionId;
use crate::types::messages::{ChatMessage, Role};
use crate::types::options::ChatOptions;

/// Heartbeat frame sent by the connection keep-alive task
pub const HEARTBEAT_FRAME: &str = r#"{"type":"heartbeat"}"#;

/// Outbound request envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Access token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// User name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Question being asked
    pub question: String,
    /// Session id the request belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_code: Option<String>,
    /// Structured message list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    /// Deprecated prompt tip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tip: Option<String>,
    /// Deprecated system tip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_tip: Option<String>,
    /// Deprecated chat history list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatMessage>>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Frequency penalty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Presence penalty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Maximum answer tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Workflow trigger mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_mode: Option<String>,
    /// Target workflow id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Target node id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Node inputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Map<String, Value>>,
    /// Workflow debug flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl RequestEnvelope {
    /// Build a chat request envelope
    ///
    /// The question is the content of the last user message when a
    /// structured message list is supplied, otherwise the prompt. Structured
    /// messages take precedence over the deprecated tip and history fields.
    ///
    /// # Errors
    /// Returns `RequestFailed` when neither a prompt nor a user message
    /// supplies a question
    pub fn chat(
        config: &ClientConfig,
        session_id: &SessionId,
        prompt: Option<&str>,
        messages: Option<&[ChatMessage]>,
        options: &ChatOptions,
    ) -> Result<Self> {
        let messages = messages.filter(|m| !m.is_empty());
        let question = messages
            .and_then(|m| m.iter().rev().find(|msg| msg.role == Role::User))
            .map(|msg| msg.content.clone())
            .or_else(|| prompt.map(str::to_string))
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ChatFlowError::request_failed("request has no question"))?;

        let options = if messages.is_some() && options.has_legacy_fields() {
            log::warn!(
                "[{session_id}] structured messages supplied together with deprecated prompt_tip/system_tip/history; using messages"
            );
            options.clone().without_legacy_fields()
        } else {
            options.clone()
        };

        Ok(Self {
            key: config.key.clone(),
            token: config.token.clone(),
            username: config.username.clone(),
            question,
            segment_code: Some(session_id.as_str().to_string()),
            messages: messages.map(<[ChatMessage]>::to_vec),
            prompt_tip: options.prompt_tip,
            system_tip: options.system_tip,
            history: options.history,
            temperature: options.temperature,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            max_tokens: options.max_tokens,
            ..Self::default()
        })
    }

    /// Build a workflow request envelope
    #[must_use]
    pub fn flow(config: &ClientConfig, session_id: &SessionId, flow: &FlowRequest) -> Self {
        Self {
            key: config.key.clone(),
            token: config.token.clone(),
            username: config.username.clone(),
            question: flow.question.clone().unwrap_or_default(),
            segment_code: Some(session_id.as_str().to_string()),
            trigger_mode: flow.trigger_mode.clone(),
            flow_id: Some(flow.flow_id.clone()),
            node_id: flow.node_id.clone(),
            inputs: (!flow.inputs.is_empty()).then(|| flow.inputs.clone()),
            debug: flow.debug.then_some(true),
            ..Self::default()
        }
    }

    /// Serialize to a text frame
    ///
    /// # Errors
    /// Returns `RequestFailed` if serialization fails
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ChatFlowError::request_failed(format!("Failed to encode request: {e}")))
    }

    /// Serialize to a JSON value (for raw-request observers)
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parameters of one workflow request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowRequest {
    /// Target workflow id
    pub flow_id: String,
    /// Trigger mode
    pub trigger_mode: Option<String>,
    /// Target node id (set when answering a waiting node)
    pub node_id: Option<String>,
    /// User text
    pub question: Option<String>,
    /// Node inputs
    pub inputs: Map<String, Value>,
    /// Request debug output
    pub debug: bool,
}
