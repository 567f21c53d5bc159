//! Inbound frame processing and response timers for `ChatClient`
//!
//! Everything here runs either on a connection's reader task (frame and
//! state listeners) or on a timer task. Callbacks and result slots are
//! always resolved after the session lock is released.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use super::ClientInner;
use super::session::{Session, SessionState, StreamState};
use crate::connection::{Connection, ConnectionState};
use crate::error::ChatFlowError;
use crate::message::{ResponseEnvelope, Signal};
use crate::stream::StreamItem;
use crate::types::identifiers::{DialogId, SessionId};
use crate::types::messages::{ChatAnswer, HistoryEntry, Role, SideContent, SideContentKind};

impl ClientInner {
    /// Register the session's frame and state listeners on `connection`
    /// unless they are already attached to it
    pub(super) fn attach(self: &Arc<Self>, session: &Arc<Session>, connection: &Connection) {
        let mut attached = session.attached.lock();
        if attached.upgrade().is_some_and(|c| c.ptr_eq(connection)) {
            return;
        }

        let (inner, weak_session) = (Arc::downgrade(self), Arc::downgrade(session));
        connection.on_message(move |envelope| {
            if let Some((inner, session)) = upgrade(&inner, &weak_session) {
                inner.process_frame(&session, envelope);
            }
        });

        let (inner, weak_session) = (Arc::downgrade(self), Arc::downgrade(session));
        connection.on_state_change(move |state| {
            if let Some((inner, session)) = upgrade(&inner, &weak_session) {
                inner.connection_state_changed(&session, state);
            }
        });

        *attached = connection.downgrade();
    }

    /// Process one frame; a panic while processing fails the request as `Unknown`
    fn process_frame(self: &Arc<Self>, session: &Arc<Session>, envelope: &ResponseEnvelope) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.handle_inbound(session, envelope))) {
            let err = ChatFlowError::from_panic(payload.as_ref());
            log::error!("[{}] inbound processing panicked: {err}", session.id);
            self.fail_request(session, err);
        }
    }

    fn handle_inbound(self: &Arc<Self>, session: &Arc<Session>, envelope: &ResponseEnvelope) {
        match envelope.signal() {
            Some(Signal::MessageConfirmed | Signal::ThreadInfo) => {
                let mut st = session.state.lock();
                record_ids(&mut st, envelope);
                return;
            }
            Some(signal @ (Signal::OnlineSearch | Signal::ImageReference)) => {
                let kind = if signal == Signal::OnlineSearch {
                    SideContentKind::OnlineSearch
                } else {
                    SideContentKind::ImageReference
                };
                let content = SideContent {
                    kind,
                    data: envelope.data.clone(),
                };
                let callback = self.callbacks.read().content.clone();
                if let Some(callback) = callback {
                    self.guarded(&session.id, || callback(&session.id, &content));
                }
                return;
            }
            Some(Signal::Reasoning) => {
                let text = envelope.text();
                {
                    let mut st = session.state.lock();
                    if st.sending {
                        self.arm_timeout(session, &mut st);
                    }
                }
                let callback = self.callbacks.read().reasoning.clone();
                if let Some(callback) = callback {
                    self.guarded(&session.id, || callback(&session.id, &text));
                }
                return;
            }
            None => {}
        }

        if envelope.is_flow_frame() {
            log::debug!("[{}] ignoring workflow frame on chat session", session.id);
            return;
        }
        if !envelope.is_success() {
            let message = if envelope.message.is_empty() {
                envelope.text()
            } else {
                envelope.message.clone()
            };
            self.fail_request(session, ChatFlowError::server(&envelope.code, message));
            return;
        }

        let text = envelope.text();
        let mut st = session.state.lock();
        if !st.sending {
            log::debug!("[{}] ignoring frame with no request in flight", session.id);
            return;
        }
        record_ids(&mut st, envelope);

        if envelope.is_finished() {
            if !text.is_empty() && (!st.stream_mode || st.buffer.is_empty()) {
                st.buffer.push_str(&text);
                if let Some(queue) = st.queue.as_ref().filter(|_| st.stream_mode) {
                    queue.push(StreamItem::chunk(text));
                }
            }
            self.complete(session, st);
            return;
        }

        st.session_state = SessionState::Chatting;
        st.buffer.push_str(&text);
        if st.stream_mode
            && !text.is_empty()
            && let Some(queue) = &st.queue
        {
            queue.push(StreamItem::chunk(text));
        }
        self.arm_timeout(session, &mut st);
    }

    /// Finish the in-flight request with the buffered answer
    fn complete(&self, session: &Session, mut st: parking_lot::MutexGuard<'_, StreamState>) {
        let answer = ChatAnswer {
            text: st.buffer.clone(),
            dialog_id: st.dialog_id.clone().map(DialogId::new),
            message_id: st.message_id.clone(),
        };
        let question = st.question.clone();
        st.history
            .push(HistoryEntry::new(Role::User, question, answer.dialog_id.clone()));
        st.history.push(HistoryEntry::new(
            Role::Assistant,
            answer.text.clone(),
            answer.dialog_id.clone(),
        ));
        st.last_completed = Some(chrono::Utc::now());
        let (pending, queue) = st.reset_request();
        drop(st);

        log::debug!(
            "[{}] answer complete ({} chars)",
            session.id,
            answer.text.chars().count()
        );
        if let Some(queue) = queue {
            queue.push(StreamItem::done(
                answer.text.clone(),
                answer.dialog_id.as_ref().map(|d| d.as_str().to_string()),
            ));
        }
        if let Some(pending) = pending {
            let _ = pending.send(Ok(answer));
        }
    }

    /// Fail the in-flight request, if any, exactly once
    pub(super) fn fail_request(&self, session: &Session, err: ChatFlowError) {
        let (pending, queue) = {
            let mut st = session.state.lock();
            if !st.sending {
                return;
            }
            st.reset_request()
        };

        if err.is_connection_error() {
            log::info!("[{}] request aborted: {err}", session.id);
        } else {
            log::warn!("[{}] request failed: {err}", session.id);
        }
        let callback = self.callbacks.read().error.clone();
        if let Some(callback) = callback {
            self.guarded(&session.id, || callback(&session.id, &err));
        }
        if let Some(queue) = queue {
            queue.push(StreamItem::failed(err.clone()));
        }
        if let Some(pending) = pending {
            let _ = pending.send(Err(err));
        }
    }

    fn connection_state_changed(&self, session: &Session, state: ConnectionState) {
        match state {
            ConnectionState::Disconnected | ConnectionState::Closed => {
                self.fail_request(
                    session,
                    ChatFlowError::connection_closed(format!("connection {state} while awaiting answer")),
                );
            }
            ConnectionState::Connected => {
                let mut st = session.state.lock();
                if matches!(st.session_state, SessionState::Idle | SessionState::Closed) {
                    st.session_state = SessionState::Connected;
                }
            }
            _ => {}
        }
    }

    /// (Re)arm the response timer; any previously armed timer becomes stale
    pub(super) fn arm_timeout(self: &Arc<Self>, session: &Arc<Session>, st: &mut StreamState) {
        st.cancel_timer();
        let epoch = st.timer_epoch;
        let timeout = self.config.response_timeout;
        let (inner, weak_session) = (Arc::downgrade(self), Arc::downgrade(session));
        st.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((inner, session)) = upgrade(&inner, &weak_session) {
                inner.on_timeout(&session, epoch);
            }
        }));
    }

    fn on_timeout(&self, session: &Session, epoch: u64) {
        {
            let st = session.state.lock();
            if !st.sending || st.timer_epoch != epoch {
                return;
            }
        }
        let millis = u64::try_from(self.config.response_timeout.as_millis()).unwrap_or(u64::MAX);
        self.fail_request(session, ChatFlowError::ResponseTimeout(millis));
    }

    /// Run a user callback, logging instead of unwinding into the reader task
    fn guarded(&self, session_id: &SessionId, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            let err = ChatFlowError::from_panic(payload.as_ref());
            log::error!("[{session_id}] callback panicked: {err}");
        }
    }
}

fn record_ids(st: &mut StreamState, envelope: &ResponseEnvelope) {
    if let Some(dialog_id) = envelope.dialog_id() {
        st.dialog_id = Some(dialog_id);
    }
    if let Some(message_id) = envelope.message_id() {
        st.message_id = Some(message_id);
    }
}

fn upgrade(inner: &Weak<ClientInner>, session: &Weak<Session>) -> Option<(Arc<ClientInner>, Arc<Session>)> {
    Some((inner.upgrade()?, session.upgrade()?))
}
