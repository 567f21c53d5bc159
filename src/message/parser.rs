//! Frame parser for inbound server messages

use crate::error::{ChatFlowError, Result};

use super::envelope::ResponseEnvelope;

/// Bare-text heartbeat replies some gateways send instead of JSON
const BARE_HEARTBEATS: &[&str] = &["ping", "pong", "heartbeat"];

/// Parse a raw text frame into a typed envelope
///
/// # Arguments
/// * `frame` - Raw text frame as received from the socket
///
/// # Returns
/// Parsed envelope. Bare-text heartbeat replies decode to an envelope
/// whose `type` is `heartbeat`.
///
/// # Errors
/// Returns `ChatFlowError::InvalidResponse` if the frame is neither a bare
/// heartbeat nor a JSON object
pub fn parse_frame(frame: &str) -> Result<ResponseEnvelope> {
    let trimmed = frame.trim();
    if BARE_HEARTBEATS
        .iter()
        .any(|hb| trimmed.eq_ignore_ascii_case(hb))
    {
        return Ok(ResponseEnvelope {
            kind: super::envelope::TYPE_HEARTBEAT.to_string(),
            ..ResponseEnvelope::default()
        });
    }

    let value: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| {
        ChatFlowError::invalid_response(format!("Failed to parse frame: {e}"))
    })?;
    if !value.is_object() {
        return Err(ChatFlowError::invalid_response(format!(
            "Expected a JSON object, got: {}",
            truncate(trimmed, 120)
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| ChatFlowError::invalid_response(format!("Failed to decode envelope: {e}")))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
