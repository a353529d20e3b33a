//! Observable signals emitted by the assistant core.
//!
//! Presentation layers subscribe through an [`EventBus`]; nothing else
//! leaves the core while a download or a completion is streaming.

mod bus;
mod event;

pub use bus::{EventBus, EventBusRef, InMemoryEventBus, NullEventBus};
pub use event::{event_names, AssistantEvent, ModelStateSignal, SubmissionSignal};
