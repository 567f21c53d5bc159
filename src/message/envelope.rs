//! Inbound response envelope
//!
//! Every text frame the server sends decodes into a [`ResponseEnvelope`].
//! Fields the server omits fall back to their defaults so one type covers
//! chat chunks, out-of-band signals, heartbeats and workflow frames.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::flow::FlowEventCode;

/// Status code of a successful frame
pub const SUCCESS_CODE: &str = "000000";

/// Value of `finish` marking the last frame of an answer
pub const FINISH_FLAG: &str = "y";

/// Response type of heartbeat frames
pub const TYPE_HEARTBEAT: &str = "heartbeat";

/// Response type marking the end of an answer
pub const TYPE_LLM_END: &str = "llm_end";

/// Response type of workflow frames
pub const TYPE_FLOW: &str = "flow";

/// Out-of-band signal encoded as a negative `index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Server accepted the request (`-1`)
    MessageConfirmed,
    /// Thread metadata (`-2`)
    ThreadInfo,
    /// Online search results (`-3`)
    OnlineSearch,
    /// Image references (`-4`)
    ImageReference,
    /// Reasoning / chain-of-thought text (`-5`)
    Reasoning,
}

impl Signal {
    /// Map a frame index to a signal
    #[must_use]
    pub const fn from_index(index: i64) -> Option<Self> {
        match index {
            -1 => Some(Self::MessageConfirmed),
            -2 => Some(Self::ThreadInfo),
            -3 => Some(Self::OnlineSearch),
            -4 => Some(Self::ImageReference),
            -5 => Some(Self::Reasoning),
            _ => None,
        }
    }

    /// Wire index of this signal
    #[must_use]
    pub const fn index(self) -> i64 {
        match self {
            Self::MessageConfirmed => -1,
            Self::ThreadInfo => -2,
            Self::OnlineSearch => -3,
            Self::ImageReference => -4,
            Self::Reasoning => -5,
        }
    }
}

/// Decoded inbound frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseEnvelope {
    /// Status code, `"000000"` on success
    #[serde(deserialize_with = "lenient_string")]
    pub code: String,
    /// Status message
    #[serde(deserialize_with = "lenient_string")]
    pub message: String,
    /// Response type (`heartbeat`, `llm_end`, `flow`, `text`, ...)
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub kind: String,
    /// Chunk index; negative values are out-of-band signals
    #[serde(deserialize_with = "lenient_i64")]
    pub index: i64,
    /// Payload, a bare string or a structured object
    pub data: Value,
    /// `"y"` on the last frame of an answer
    #[serde(deserialize_with = "lenient_opt_string")]
    pub finish: Option<String>,
    /// Server-assigned dialog id
    #[serde(deserialize_with = "lenient_opt_string")]
    pub dialog_id: Option<String>,
    /// Server-assigned message id
    #[serde(deserialize_with = "lenient_opt_string")]
    pub message_id: Option<String>,
    /// Workflow event code
    pub event: Option<String>,
    /// Workflow name
    pub flow_name: Option<String>,
    /// Node type
    pub node_type: Option<String>,
    /// Node title
    pub node_title: Option<String>,
    /// Current node id
    #[serde(deserialize_with = "lenient_opt_string")]
    pub cur_node_id: Option<String>,
    /// Parent node id
    #[serde(deserialize_with = "lenient_opt_string")]
    pub parent_node_id: Option<String>,
    /// Set when the node waits for input (`1`, `"1"` or `true`)
    pub node_waiting_input: Option<Value>,
}

impl ResponseEnvelope {
    /// Whether this is a heartbeat response
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.kind.eq_ignore_ascii_case(TYPE_HEARTBEAT)
    }

    /// Whether this frame belongs to a workflow run
    #[must_use]
    pub fn is_flow_frame(&self) -> bool {
        self.kind.eq_ignore_ascii_case(TYPE_FLOW) || self.event.is_some()
    }

    /// Whether the status code signals success (a missing code counts as success)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code.is_empty() || self.code == SUCCESS_CODE
    }

    /// Whether the status code is a workflow-level (`4xx`) error
    #[must_use]
    pub fn is_workflow_error(&self) -> bool {
        self.code.starts_with('4')
    }

    /// Whether this frame ends the current answer
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finish
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(FINISH_FLAG))
            || self.kind == TYPE_LLM_END
    }

    /// Out-of-band signal carried by this frame, if any
    #[must_use]
    pub const fn signal(&self) -> Option<Signal> {
        Signal::from_index(self.index)
    }

    /// Workflow event code, if present and known
    #[must_use]
    pub fn event_code(&self) -> Option<FlowEventCode> {
        self.event.as_deref().and_then(FlowEventCode::parse)
    }

    /// Whether the current node waits for user input
    #[must_use]
    pub fn waits_for_input(&self) -> bool {
        match &self.node_waiting_input {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "y" | "yes"),
            _ => false,
        }
    }

    /// Display text of the payload
    #[must_use]
    pub fn text(&self) -> String {
        extract_text(&self.data)
    }

    /// Dialog id, looking inside structured payloads when the envelope lacks one
    #[must_use]
    pub fn dialog_id(&self) -> Option<String> {
        self.dialog_id
            .clone()
            .or_else(|| string_field(&self.data, &["dialog_id", "dialogId"]))
    }

    /// Message id, looking inside structured payloads when the envelope lacks one
    #[must_use]
    pub fn message_id(&self) -> Option<String> {
        self.message_id
            .clone()
            .or_else(|| string_field(&self.data, &["message_id", "messageId"]))
    }

    /// Variables carried by a structured payload (`data.variables` or `data.outputs`)
    #[must_use]
    pub fn variables(&self) -> HashMap<String, Value> {
        ["variables", "outputs"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_object))
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// Keys probed, in order, when a payload is a structured object
const TEXT_KEYS: &[&str] = &["content", "text", "answer", "output"];

/// Extract display text from a bare-string or structured payload
#[must_use]
pub fn extract_text(data: &Value) -> String {
    match data {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items.iter().map(extract_text).collect(),
        Value::Object(map) => TEXT_KEYS
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(nested @ Value::Object(_)) => Some(extract_text(nested)),
                _ => None,
            })
            .unwrap_or_default(),
    }
}

fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("index out of range: {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid index: {s:?}"))),
        other => Err(serde::de::Error::custom(format!("invalid index: {other}"))),
    }
}
