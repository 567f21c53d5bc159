//! Workflow run state machine
//!
//! [`RunState::on_frame`] turns one inbound envelope into the events to
//! emit and, when the run ends, the value that settles the completion
//! future. It never calls user code; the caller dispatches the returned
//! events after releasing the run lock.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ChatFlowError, Result};
use crate::message::{FlowRequest, ResponseEnvelope, extract_text};
use crate::types::flow::{
    FlowDebug, FlowEnd, FlowEvent, FlowEventCode, FlowFailure, FlowMessage, FlowOutcome,
    FlowStart, FlowState, FlowWaiting, NodeInfo,
};
use crate::types::messages::{ChatMessage, Role};

/// Answer-text marker of a server-side exception, optionally followed by a numeric code
pub const SYSTEM_EXCEPTION_MARKER: &str = "[system_exception]";

/// Answer-text marker of a request blocked by content moderation
pub const RISK_CONTROL_MARKER: &str = "[risk_control_blocked]";

/// Debug text prefixes that are never surfaced
const INTERNAL_DEBUG_PREFIXES: &[&str] = &["[trace]", "[internal]", "__"];

/// Output of processing one frame
#[derive(Debug, Default)]
pub(crate) struct Step {
    pub(crate) events: Vec<FlowEvent>,
    pub(crate) settle: Option<Result<FlowOutcome>>,
}

impl Step {
    fn emit(&mut self, event: FlowEvent) {
        self.events.push(event);
    }
}

/// State of the current run
pub(crate) struct RunState {
    pub(crate) state: FlowState,
    pub(crate) started: bool,
    start_emitted: bool,
    /// Set once the waiting event of the current episode was emitted
    waiting_emitted: bool,
    pub(crate) request: Option<FlowRequest>,
    pub(crate) completion: Option<oneshot::Sender<Result<FlowOutcome>>>,
    pub(crate) node: NodeInfo,
    pub(crate) dialog_id: Option<String>,
    /// Turns of the run, used as a fallback source of waiting text
    pub(crate) transcript: Vec<ChatMessage>,
    /// Message chunks since the last turn boundary
    answer: String,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            state: FlowState::Idle,
            started: false,
            start_emitted: false,
            waiting_emitted: false,
            request: None,
            completion: None,
            node: NodeInfo::default(),
            dialog_id: None,
            transcript: Vec::new(),
            answer: String::new(),
        }
    }

    /// Move to `next` if legal
    ///
    /// A run still in `Idle`/`Starting` that receives a waiting or end
    /// frame passes through `Running` first.
    pub(crate) fn transition(&mut self, next: FlowState) -> bool {
        if matches!(self.state, FlowState::Idle | FlowState::Starting)
            && matches!(next, FlowState::Waiting | FlowState::Completed)
        {
            self.state = FlowState::Running;
        }
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("ignoring illegal flow transition {} -> {next}", self.state);
            return false;
        }
        log::debug!("flow state {} -> {next}", self.state);
        self.state = next;
        true
    }

    /// Leave a waiting episode after the user answered
    pub(crate) fn resume(&mut self, input: &str) {
        self.flush_answer();
        self.transcript.push(ChatMessage::user(input));
        self.waiting_emitted = false;
        self.transition(FlowState::Running);
    }

    /// Terminal failure: state, event and completion
    pub(crate) fn fail(&mut self, next: FlowState, error: ChatFlowError, node: NodeInfo, step: &mut Step) {
        if !self.transition(next) {
            return;
        }
        step.emit(FlowEvent::Error(FlowFailure {
            error: error.clone(),
            node,
        }));
        step.settle = Some(Err(error));
    }

    pub(crate) fn on_frame(&mut self, envelope: &ResponseEnvelope) -> Step {
        let mut step = Step::default();
        if envelope.is_heartbeat() {
            return step;
        }
        let code = envelope.event_code();
        if !self.started && code != Some(FlowEventCode::Start) {
            log::trace!("flow not started, ignoring frame");
            return step;
        }
        if self.state.is_terminal() {
            return step;
        }

        step.emit(FlowEvent::RawResponse(Box::new(envelope.clone())));
        let node = NodeInfo::from_envelope(envelope);
        if node.cur_node_id.is_some() {
            self.node = node.clone();
        }
        if let Some(dialog_id) = envelope.dialog_id() {
            self.dialog_id = Some(dialog_id);
        }

        if !envelope.is_success() {
            let message = if envelope.message.is_empty() {
                envelope.text()
            } else {
                envelope.message.clone()
            };
            self.fail(
                FlowState::Error,
                ChatFlowError::server(&envelope.code, message),
                node,
                &mut step,
            );
            return step;
        }

        let answer = answer_text(envelope);
        if let Some(pos) = answer.find(SYSTEM_EXCEPTION_MARKER) {
            let rest = answer[pos + SYSTEM_EXCEPTION_MARKER.len()..].trim_start();
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            let message = [answer[..pos].trim(), rest[digits.len()..].trim()]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            let code = if digits.is_empty() {
                "system_exception".to_string()
            } else {
                digits
            };
            self.fail(FlowState::Error, ChatFlowError::server(code, message), node, &mut step);
            return step;
        }
        if answer.contains(RISK_CONTROL_MARKER) {
            let message = answer.replace(RISK_CONTROL_MARKER, "").trim().to_string();
            let message = if message.is_empty() {
                "blocked by risk control".to_string()
            } else {
                message
            };
            self.fail(
                FlowState::Aborted,
                ChatFlowError::server("risk_control_blocked", message),
                node,
                &mut step,
            );
            return step;
        }

        match code {
            Some(FlowEventCode::Start) => {
                if !self.start_emitted {
                    self.start_emitted = true;
                    self.started = true;
                    self.transition(FlowState::Running);
                    step.emit(FlowEvent::Start(FlowStart {
                        node,
                        dialog_id: self.dialog_id.clone(),
                    }));
                }
            }
            Some(FlowEventCode::End) => {
                if self.transition(FlowState::Completed) {
                    self.flush_answer();
                    let text = end_text(envelope);
                    let variables = envelope.variables();
                    step.emit(FlowEvent::End(FlowEnd {
                        text: text.clone(),
                        node,
                        variables: variables.clone(),
                    }));
                    step.settle = Some(Ok(FlowOutcome { text, variables }));
                }
            }
            Some(FlowEventCode::Waiting) => self.enter_waiting(envelope, node, &mut step),
            Some(FlowEventCode::NodeEnter) => step.emit(FlowEvent::NodeEnter(node)),
            Some(FlowEventCode::Jump) => step.emit(FlowEvent::Jump(node)),
            Some(FlowEventCode::Debug) => {
                let text = envelope.text();
                if is_internal_debug(&text) {
                    log::trace!("suppressed internal debug output");
                } else {
                    step.emit(FlowEvent::Debug(FlowDebug {
                        text,
                        node,
                        data: envelope.data.clone(),
                    }));
                }
            }
            Some(FlowEventCode::Error) => {
                let message = if envelope.message.is_empty() {
                    envelope.text()
                } else {
                    envelope.message.clone()
                };
                let code = if envelope.code.is_empty() {
                    "error".to_string()
                } else {
                    envelope.code.clone()
                };
                self.fail(FlowState::Error, ChatFlowError::server(code, message), node, &mut step);
            }
            Some(FlowEventCode::Success) | None => {
                if envelope.waits_for_input() {
                    self.enter_waiting(envelope, node, &mut step);
                } else {
                    let text = envelope.text();
                    if !text.is_empty() && !envelope.is_finished() {
                        self.answer.push_str(&text);
                        step.emit(FlowEvent::Message(FlowMessage {
                            text,
                            node,
                            finished: false,
                        }));
                    }
                }
            }
        }
        step
    }

    /// Enter `Waiting`; the event fires once per waiting episode
    fn enter_waiting(&mut self, envelope: &ResponseEnvelope, node: NodeInfo, step: &mut Step) {
        if self.state == FlowState::Waiting && self.waiting_emitted {
            return;
        }
        if !self.transition(FlowState::Waiting) {
            return;
        }
        self.waiting_emitted = true;
        self.flush_answer();
        let text = waiting_text(envelope, &self.transcript);
        step.emit(FlowEvent::Waiting(FlowWaiting {
            text,
            node,
            variables: envelope.variables(),
        }));
    }

    fn flush_answer(&mut self) {
        if !self.answer.is_empty() {
            let answer = std::mem::take(&mut self.answer);
            self.transcript.push(ChatMessage::assistant(answer));
        }
    }
}

/// Answer text checked for sentinels: `data.answer` when present, else the display text
fn answer_text(envelope: &ResponseEnvelope) -> String {
    match envelope.data.get("answer") {
        Some(Value::String(s)) => s.clone(),
        _ => envelope.text(),
    }
}

/// Final text of an end frame: `data.answer`, then `data.replying`, then the display text
fn end_text(envelope: &ResponseEnvelope) -> String {
    if let Some(Value::String(answer)) = envelope.data.get("answer")
        && !answer.is_empty()
    {
        return answer.clone();
    }
    match envelope.data.get("replying") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(replying @ Value::Object(_)) => {
            let text = extract_text(replying);
            if text.is_empty() { envelope.text() } else { text }
        }
        _ => envelope.text(),
    }
}

/// Prompt of a waiting frame
///
/// Falls back to the most recent non-empty turn of the payload's `history`
/// list, then to the most recent non-empty assistant turn of the run.
fn waiting_text(envelope: &ResponseEnvelope, transcript: &[ChatMessage]) -> String {
    let direct = envelope.text();
    if !direct.trim().is_empty() {
        return direct;
    }
    let from_payload = envelope
        .data
        .get("history")
        .and_then(Value::as_array)
        .and_then(|turns| {
            turns
                .iter()
                .rev()
                .map(extract_text)
                .find(|text| !text.trim().is_empty())
        });
    from_payload
        .or_else(|| {
            transcript
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
                .map(|m| m.content.clone())
        })
        .unwrap_or_default()
}

fn is_internal_debug(text: &str) -> bool {
    let trimmed = text.trim_start();
    INTERNAL_DEBUG_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}
