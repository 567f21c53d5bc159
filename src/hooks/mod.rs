//! Handler registry for workflow events
//!
//! Handlers are registered against a set of [`FlowEventType`]s (or against
//! every event) and invoked in registration order. A panicking handler is
//! isolated: the panic is caught, converted to an `Unknown` error and
//! reported back to the caller of [`HandlerRegistry::dispatch`] while the
//! remaining handlers still run.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::ChatFlowError;
use crate::types::flow::{FlowEvent, FlowEventType};

/// Callback invoked for a workflow event
pub type FlowHandler = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    /// `None` matches every event type
    kinds: Option<HashSet<FlowEventType>>,
    handler: FlowHandler,
}

/// Dispatch table from event type to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for the given event types
    ///
    /// An empty set matches nothing; use [`register_all`](Self::register_all)
    /// to match every event.
    pub fn register(
        &mut self,
        kinds: impl IntoIterator<Item = FlowEventType>,
        handler: FlowHandler,
    ) -> HandlerId {
        self.push(Some(kinds.into_iter().collect()), handler)
    }

    /// Register a handler for every event
    pub fn register_all(&mut self, handler: FlowHandler) -> HandlerId {
        self.push(None, handler)
    }

    fn push(&mut self, kinds: Option<HashSet<FlowEventType>>, handler: FlowHandler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.entries.push(Entry { id, kinds, handler });
        id
    }

    /// Unregister a handler; returns whether it was registered
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Unregister every handler
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of handlers matching `kind`
    #[must_use]
    pub fn count(&self, kind: FlowEventType) -> usize {
        self.entries.iter().filter(|e| Self::matches(e.kinds.as_ref(), kind)).count()
    }

    /// Whether a filter matches an event type
    ///
    /// ```
    /// use std::collections::HashSet;
    /// use chatflow_client::hooks::HandlerRegistry;
    /// use chatflow_client::FlowEventType;
    ///
    /// assert!(HandlerRegistry::matches(None, FlowEventType::End));
    /// let only_end: HashSet<_> = [FlowEventType::End].into();
    /// assert!(HandlerRegistry::matches(Some(&only_end), FlowEventType::End));
    /// assert!(!HandlerRegistry::matches(Some(&only_end), FlowEventType::Start));
    /// ```
    #[must_use]
    pub fn matches(kinds: Option<&HashSet<FlowEventType>>, kind: FlowEventType) -> bool {
        kinds.is_none_or(|set| set.contains(&kind))
    }

    /// Handlers matching `kind`, in registration order
    ///
    /// Take a snapshot before invoking so no lock is held while user code runs.
    #[must_use]
    pub fn snapshot(&self, kind: FlowEventType) -> Vec<FlowHandler> {
        self.entries
            .iter()
            .filter(|e| Self::matches(e.kinds.as_ref(), kind))
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Invoke every handler matching the event
    ///
    /// Returns one `Unknown` error per panicking handler.
    pub fn dispatch(&self, event: &FlowEvent) -> Vec<ChatFlowError> {
        invoke(&self.snapshot(event.event_type()), event)
    }

    /// Wrap a closure as a [`FlowHandler`]
    pub fn handler<F>(f: F) -> FlowHandler
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        Arc::new(f)
    }
}

/// Invoke a handler snapshot, isolating panics
pub fn invoke(handlers: &[FlowHandler], event: &FlowEvent) -> Vec<ChatFlowError> {
    handlers
        .iter()
        .filter_map(|handler| {
            catch_unwind(AssertUnwindSafe(|| handler(event)))
                .err()
                .map(|payload| ChatFlowError::from_panic(payload.as_ref()))
        })
        .collect()
}
