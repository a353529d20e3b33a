pub mod chat_format;
pub mod completion;
mod config;
mod constants;
pub mod orchestrator;
pub mod profile;
mod services;

pub use chat_format::{format_chat, ChatTemplate, TemplateError};
pub use completion::{Completion, CompletionController, CompletionError, StopReason};
pub use config::AppConfig;
pub use constants::*;
pub use orchestrator::{
    ChatError, ChatOrchestrator, Redirect, SubmissionFailure, SubmissionOutcome, ValidationError,
};
pub use profile::{ChildProfile, ProfileService, ProfileUpdate};
pub use services::{AssistantServices, ServiceError};
