//! `FlowClient` for driving workflow runs
//!
//! A workflow run shares one connection (through a
//! [`SingleConnectionRegistry`]) and is driven by server events:
//!
//! ```text
//!  Idle ─start()─▶ Starting ─flow_start─▶ Running ─flow_waiting─▶ Waiting
//!                                           ▲                        │
//!                                           └──────── send() ────────┘
//!  Running/Waiting ─flow_end─▶ Completed
//!  any non-terminal ─error / [system_exception]─▶ Error
//!  any non-terminal ─abort() / [risk_control_blocked]─▶ Aborted
//! ```
//!
//! Events are delivered to handlers registered with the `on_*` methods, in
//! the order the frames arrive. No event is delivered once the run reached
//! a terminal state.
//!
//! # Example
//!
//! ```no_run
//! use chatflow_client::{ClientConfig, FlowClient, FlowRequest};
//!
//! # async fn example() -> chatflow_client::Result<()> {
//! let flow = FlowClient::new(ClientConfig::from_env()?)?;
//! let answering = flow.clone();
//! flow.on_waiting(move |waiting| {
//!     log::info!("flow asks: {}", waiting.text);
//!     let _ = answering.send("yes");
//! });
//! let done = flow
//!     .start(FlowRequest { flow_id: "onboarding".into(), ..FlowRequest::default() })
//!     .await?;
//! let outcome = done.await?;
//! log::info!("flow finished: {}", outcome.text);
//! flow.close().await;
//! # Ok(())
//! # }
//! ```

mod machine;

pub use machine::{RISK_CONTROL_MARKER, SYSTEM_EXCEPTION_MARKER};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

use crate::connection::{Connection, ConnectionState, WeakConnection};
use crate::error::{ChatFlowError, Result};
use crate::hooks::{FlowHandler, HandlerId, HandlerRegistry, invoke};
use crate::message::{FlowRequest, RequestEnvelope, ResponseEnvelope};
use crate::registry::{ConnectionRegistry, SHUTDOWN_GRACE, SingleConnectionRegistry};
use crate::transport::{Connector, WebSocketConnector};
use crate::types::config::ClientConfig;
use crate::types::flow::{
    FlowDebug, FlowEnd, FlowEvent, FlowEventType, FlowFailure, FlowMessage, FlowOutcome,
    FlowStart, FlowState, FlowWaiting, NodeInfo,
};
use crate::types::identifiers::SessionId;
use crate::types::messages::ChatMessage;
use machine::{RunState, Step};

/// Shared future settling when a run completes, fails or is aborted
pub type FlowCompletion = Shared<BoxFuture<'static, Result<FlowOutcome>>>;

struct FlowInner {
    config: Arc<ClientConfig>,
    session_id: SessionId,
    registry: SingleConnectionRegistry,
    run: Mutex<RunState>,
    handlers: RwLock<HandlerRegistry>,
    attached: Mutex<WeakConnection>,
}

/// Client for one workflow run at a time
///
/// Cloning is cheap; clones drive the same run.
#[derive(Clone)]
pub struct FlowClient {
    inner: Arc<FlowInner>,
}

impl FlowClient {
    /// Create a flow client that connects over WebSocket
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(WebSocketConnector::new()))
    }

    /// Create a flow client with a custom connector
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            inner: Arc::new(FlowInner {
                registry: SingleConnectionRegistry::new(Arc::clone(&config), connector),
                config,
                session_id: SessionId::new(format!("flow-{}", uuid::Uuid::new_v4())),
                run: Mutex::new(RunState::new()),
                handlers: RwLock::new(HandlerRegistry::new()),
                attached: Mutex::new(WeakConnection::default()),
            }),
        })
    }

    /// Session id sent as `segment_code` with every request of this client
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Current run state
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.inner.run.lock().state
    }

    /// Node the run is currently at
    #[must_use]
    pub fn current_node(&self) -> NodeInfo {
        self.inner.run.lock().node.clone()
    }

    /// Start a run
    ///
    /// Connects if needed, sends the start request and returns a future that
    /// settles with the run's outcome. A previous run that reached a
    /// terminal state is replaced.
    ///
    /// # Errors
    /// - `SessionError` if a run is already in progress
    /// - connection errors if the connection cannot be established
    /// - `SendFailed` if the request cannot be written
    pub async fn start(&self, request: FlowRequest) -> Result<FlowCompletion> {
        let (tx, rx) = oneshot::channel();
        {
            let mut run = self.inner.run.lock();
            if run.started && !run.state.is_terminal() {
                return Err(ChatFlowError::session(format!(
                    "flow run already in progress ({})",
                    run.state
                )));
            }
            *run = RunState::new();
            run.started = true;
            run.transition(FlowState::Starting);
            run.request = Some(request.clone());
            if let Some(question) = request.question.as_deref().filter(|q| !q.is_empty()) {
                run.transcript.push(ChatMessage::user(question));
            }
            run.completion = Some(tx);
        }
        let completion: FlowCompletion = async move {
            rx.await
                .unwrap_or_else(|_| Err(ChatFlowError::session("flow run was dropped")))
        }
        .boxed()
        .shared();

        log::info!("[{}] starting flow {}", self.inner.session_id, request.flow_id);
        let connection = match self.inner.connection().await {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.fail_run(err.clone());
                return Err(err);
            }
        };
        let envelope = RequestEnvelope::flow(&self.inner.config, &self.inner.session_id, &request);
        self.inner.send_envelope(&connection, &envelope)?;
        Ok(completion)
    }

    /// Answer the node the run is waiting on
    ///
    /// # Errors
    /// - `NotWaiting` if the run is executing
    /// - `NotRunning` if the run has not started or has ended
    ///
    /// Either error also rejects the run's completion future.
    pub fn send(&self, input: impl Into<String>) -> Result<()> {
        let input = input.into();
        let envelope = {
            let mut run = self.inner.run.lock();
            let rejected = match run.state {
                FlowState::Waiting => None,
                state @ FlowState::Running => Some(ChatFlowError::NotWaiting(state.to_string())),
                state => Some(ChatFlowError::NotRunning(state.to_string())),
            };
            if let Some(err) = rejected {
                if let Some(completion) = run.completion.take() {
                    let _ = completion.send(Err(err.clone()));
                }
                return Err(err);
            }

            let base = run.request.clone().unwrap_or_default();
            let follow_up = FlowRequest {
                flow_id: base.flow_id,
                trigger_mode: base.trigger_mode,
                node_id: run.node.cur_node_id.clone(),
                question: Some(input.clone()),
                inputs: serde_json::Map::new(),
                debug: base.debug,
            };
            run.resume(&input);
            RequestEnvelope::flow(&self.inner.config, &self.inner.session_id, &follow_up)
        };

        let Some(connection) = self.inner.registry.lookup(&self.inner.session_id) else {
            let err = ChatFlowError::send_failed("flow connection is gone");
            self.inner.fail_run(err.clone());
            return Err(err);
        };
        self.inner.send_envelope(&connection, &envelope)
    }

    /// Abort the run and disconnect
    ///
    /// The completion future rejects with `SessionError`. No-op once the run
    /// has ended.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let completion = {
            let mut run = self.inner.run.lock();
            if run.state.is_terminal() || !run.transition(FlowState::Aborted) {
                return;
            }
            run.completion.take()
        };
        log::info!("[{}] flow aborted: {reason}", self.inner.session_id);
        if let Some(completion) = completion {
            let _ = completion.send(Err(ChatFlowError::session(format!("flow aborted: {reason}"))));
        }
        self.inner.registry.disconnect(&self.inner.session_id);
    }

    /// Abort any unfinished run and release the connection
    pub async fn close(&self) {
        let unfinished = {
            let run = self.inner.run.lock();
            run.started && !run.state.is_terminal()
        };
        if unfinished {
            self.abort("client closed");
        }
        self.inner.registry.shutdown(SHUTDOWN_GRACE).await;
        self.inner.handlers.write().clear();
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Handle every event of the given kind
    pub fn on(&self, kind: FlowEventType, handler: impl Fn(&FlowEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.handlers.write().register([kind], Arc::new(handler))
    }

    /// Handle every event
    pub fn on_any(&self, handler: impl Fn(&FlowEvent) + Send + Sync + 'static) -> HandlerId {
        self.inner.handlers.write().register_all(Arc::new(handler))
    }

    /// Unregister a handler
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.write().remove(id)
    }

    /// Display text chunks
    pub fn on_message(&self, handler: impl Fn(&FlowMessage) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Message, move |event| {
            if let FlowEvent::Message(message) = event {
                handler(message);
            }
        })
    }

    /// Waiting for input, once per waiting episode
    pub fn on_waiting(&self, handler: impl Fn(&FlowWaiting) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Waiting, move |event| {
            if let FlowEvent::Waiting(waiting) = event {
                handler(waiting);
            }
        })
    }

    /// Run completed
    pub fn on_end(&self, handler: impl Fn(&FlowEnd) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::End, move |event| {
            if let FlowEvent::End(end) = event {
                handler(end);
            }
        })
    }

    /// Run failed, or a handler panicked
    pub fn on_error(&self, handler: impl Fn(&FlowFailure) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Error, move |event| {
            if let FlowEvent::Error(failure) = event {
                handler(failure);
            }
        })
    }

    /// Run started
    pub fn on_start(&self, handler: impl Fn(&FlowStart) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Start, move |event| {
            if let FlowEvent::Start(start) = event {
                handler(start);
            }
        })
    }

    /// Diagnostic output
    pub fn on_debug(&self, handler: impl Fn(&FlowDebug) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Debug, move |event| {
            if let FlowEvent::Debug(debug) = event {
                handler(debug);
            }
        })
    }

    /// Node entered
    pub fn on_node_enter(&self, handler: impl Fn(&NodeInfo) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::NodeEnter, move |event| {
            if let FlowEvent::NodeEnter(node) = event {
                handler(node);
            }
        })
    }

    /// Jump between nodes
    pub fn on_jump(&self, handler: impl Fn(&NodeInfo) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::Jump, move |event| {
            if let FlowEvent::Jump(node) = event {
                handler(node);
            }
        })
    }

    /// Outbound envelopes as sent
    pub fn on_raw_request(&self, handler: impl Fn(&serde_json::Value) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::RawRequest, move |event| {
            if let FlowEvent::RawRequest(value) = event {
                handler(value);
            }
        })
    }

    /// Inbound envelopes as received
    pub fn on_raw_response(&self, handler: impl Fn(&ResponseEnvelope) + Send + Sync + 'static) -> HandlerId {
        self.on(FlowEventType::RawResponse, move |event| {
            if let FlowEvent::RawResponse(envelope) = event {
                handler(envelope);
            }
        })
    }

    /// Connection established, lost or being re-established
    pub fn on_connection(&self, handler: impl Fn(FlowEventType) + Send + Sync + 'static) -> HandlerId {
        let handler: FlowHandler = Arc::new(move |event: &FlowEvent| handler(event.event_type()));
        self.inner.handlers.write().register(
            [
                FlowEventType::Connected,
                FlowEventType::Disconnected,
                FlowEventType::Reconnecting,
            ],
            handler,
        )
    }
}

impl FlowInner {
    /// Connected connection for the run, with listeners attached
    async fn connection(self: &Arc<Self>) -> Result<Connection> {
        let connection = self.registry.get(&self.session_id)?;
        self.attach(&connection);
        connection.connect().await?;
        Ok(connection)
    }

    fn attach(self: &Arc<Self>, connection: &Connection) {
        let mut attached = self.attached.lock();
        if attached.upgrade().is_some_and(|c| c.ptr_eq(connection)) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        connection.on_message(move |envelope| {
            if let Some(inner) = weak.upgrade() {
                inner.process_frame(envelope);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(self);
        connection.on_state_change(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_state_changed(state);
            }
        });
        *attached = connection.downgrade();
    }

    fn send_envelope(&self, connection: &Connection, envelope: &RequestEnvelope) -> Result<()> {
        if !self.run.lock().state.is_terminal() {
            self.deliver(vec![FlowEvent::RawRequest(envelope.to_value())]);
        }
        connection.send(envelope).inspect_err(|err| {
            log::warn!("[{}] flow request failed: {err}", self.session_id);
            self.fail_run(err.clone());
        })
    }

    fn process_frame(&self, envelope: &ResponseEnvelope) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run.lock().on_frame(envelope)));
        match outcome {
            Ok(step) => self.apply(step),
            Err(payload) => {
                let err = ChatFlowError::from_panic(payload.as_ref());
                log::error!("[{}] flow frame processing panicked: {err}", self.session_id);
                self.fail_run(err);
            }
        }
    }

    fn connection_state_changed(&self, state: ConnectionState) {
        if self.run.lock().state.is_terminal() {
            return;
        }
        if let Some(event) = FlowEvent::from_connection_state(state) {
            self.deliver(vec![event]);
        }
    }

    /// Move a live run to `Error` and report `err`
    fn fail_run(&self, err: ChatFlowError) {
        let step = {
            let mut run = self.run.lock();
            let mut step = Step::default();
            let node = run.node.clone();
            run.fail(FlowState::Error, err, node, &mut step);
            step
        };
        self.apply(step);
    }

    /// Deliver a step's events, then settle the completion future
    fn apply(&self, step: Step) {
        self.deliver(step.events);
        if let Some(result) = step.settle {
            let completion = self.run.lock().completion.take();
            if let Some(completion) = completion {
                let _ = completion.send(result);
            }
        }
    }

    fn deliver(&self, events: Vec<FlowEvent>) {
        for event in events {
            let handlers = self.handlers.read().snapshot(event.event_type());
            let panics = invoke(&handlers, &event);
            if panics.is_empty() || event.event_type() == FlowEventType::Error {
                for err in panics {
                    log::error!("[{}] flow error handler panicked: {err}", self.session_id);
                }
                continue;
            }
            let node = self.run.lock().node.clone();
            let error_handlers = self.handlers.read().snapshot(FlowEventType::Error);
            for err in panics {
                log::error!("[{}] flow handler panicked: {err}", self.session_id);
                let failure = FlowEvent::Error(FlowFailure {
                    error: err,
                    node: node.clone(),
                });
                for nested in invoke(&error_handlers, &failure) {
                    log::error!("[{}] flow error handler panicked: {nested}", self.session_id);
                }
            }
        }
    }
}
