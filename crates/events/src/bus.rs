//! Event bus abstraction for decoupled event emission.
//!
//! Lets the core run headless and under test without a UI attached.

use crate::AssistantEvent;
use std::sync::{Arc, Mutex};

/// Sink for events emitted by the core.
///
/// Keeps the catalog, engine and chat flow independent of whatever front end
/// is attached, so they can run:
/// - under unit tests with a capturing bus
/// - from the headless CLI
/// - behind a UI that forwards `topic()`/`payload()` to its own event system
pub trait EventBus: Send + Sync {
    /// Emit one event.
    ///
    /// Called synchronously on the emitting task, never while a core lock is
    /// held, so implementations may call back into the core.
    ///
    /// # Arguments
    /// * `event` - The event; route by [`AssistantEvent::topic`] if needed
    fn emit(&self, event: AssistantEvent);
}

/// Type alias for shared event bus reference.
pub type EventBusRef = Arc<dyn EventBus>;

/// In-memory event bus for testing.
///
/// Captures all emitted events for later inspection.
#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<AssistantEvent>>,
}

impl InMemoryEventBus {
    /// Create an empty capturing bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all captured events, in emission order.
    pub fn events(&self) -> Vec<AssistantEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Get events for a specific topic.
    pub fn events_for(&self, topic: &str) -> Vec<AssistantEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.topic() == topic)
            .cloned()
            .collect()
    }

    /// Drop every captured event.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Number of captured events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// Check if nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, event: AssistantEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// No-op event bus that discards all events.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: AssistantEvent) {}
}
