//! One chat submission, from validation to a terminal state.
//!
//! ```text
//! Idle -> Validating -> Rejected
//!                    -> PromptBuilt -> Streaming -> Completed | Cancelled | Failed
//! ```
//!
//! Messages appended for a submission are never rolled back; the assistant
//! placeholder keeps the last content written to it.

use crate::chat_format::{format_chat, TemplateError};
use crate::completion::{CompletionController, StopReason};
use crate::profile::ChildProfile;
use crate::CONVERSATIONS_KEY;
use ndis_conversation::{ConversationError, ConversationId, ConversationStore, Message, MessageId, Role};
use ndis_engine::{EngineError, EngineManager};
use ndis_events::{AssistantEvent, EventBusRef, SubmissionSignal};
use ndis_storage::{KeyValueStore, KeyValueStoreExt};
use std::sync::Arc;

/// Screen the presentation layer should send the user to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    Profile,
    Model,
}

/// A submission rejected before anything was appended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("child profile is incomplete (missing: {})", .0.join(", "))]
    ProfileIncomplete(Vec<&'static str>),
    #[error("no model loaded")]
    NoModelLoaded,
    #[error("a response is already being generated")]
    AlreadyGenerating,
    #[error("message is empty")]
    EmptyMessage,
}

impl ValidationError {
    pub fn redirect(&self) -> Option<Redirect> {
        match self {
            Self::ProfileIncomplete(_) => Some(Redirect::Profile),
            Self::NoModelLoaded => Some(Redirect::Model),
            Self::AlreadyGenerating | Self::EmptyMessage => None,
        }
    }

    /// Rejections the caller should drop silently.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::AlreadyGenerating)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

/// Why a submission ended in the Failed state.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionFailure {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug)]
pub enum SubmissionOutcome {
    Completed {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    Cancelled {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },
    Failed {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
        error: SubmissionFailure,
    },
}

impl SubmissionOutcome {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Completed { conversation_id, .. }
            | Self::Cancelled { conversation_id, .. }
            | Self::Failed { conversation_id, .. } => *conversation_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Completed { message_id, .. }
            | Self::Cancelled { message_id, .. }
            | Self::Failed { message_id, .. } => *message_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Completed { content, .. }
            | Self::Cancelled { content, .. }
            | Self::Failed { content, .. } => content,
        }
    }

    fn signal(&self) -> SubmissionSignal {
        match self {
            Self::Completed { .. } => SubmissionSignal::Completed,
            Self::Cancelled { .. } => SubmissionSignal::Cancelled,
            Self::Failed { .. } => SubmissionSignal::Failed,
        }
    }
}

pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    engine: Arc<EngineManager>,
    completion: Arc<CompletionController>,
    persistence: Arc<dyn KeyValueStore>,
    events: EventBusRef,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        engine: Arc<EngineManager>,
        completion: Arc<CompletionController>,
        persistence: Arc<dyn KeyValueStore>,
        events: EventBusRef,
    ) -> Self {
        Self {
            store,
            engine,
            completion,
            persistence,
            events,
        }
    }

    /// Submit `text` to `current` (or a new conversation when `None`).
    ///
    /// `Err` means the submission was rejected and nothing was appended.
    /// Otherwise the outcome names the conversation and the assistant
    /// message that received the streamed content.
    pub async fn submit(
        &self,
        current: Option<ConversationId>,
        text: &str,
        profile: &ChildProfile,
    ) -> Result<SubmissionOutcome, ChatError> {
        self.validate(text, profile)?;

        let history: Vec<Message> = match current {
            Some(id) => self
                .store
                .get_conversation_by_id(id)
                .ok_or(ConversationError::ConversationNotFound(id))?
                .messages()
                .to_vec(),
            None => Vec::new(),
        };

        let user = self.store.new_message(Role::User, text);
        let placeholder = self.store.new_message(Role::Assistant, "");
        let message_id = placeholder.id();
        let conversation_id = match current {
            Some(id) => {
                self.store.add_message_to_conversation(id, user.clone())?;
                id
            }
            None => self.store.new_conversation(user.clone())?.id(),
        };
        self.store
            .add_message_to_conversation(conversation_id, placeholder)?;

        tracing::info!(conversation_id = %conversation_id, message_id = %message_id, "Submission accepted");

        let outcome = self
            .generate(conversation_id, message_id, history, user, profile)
            .await;

        self.persist();
        self.events.emit(AssistantEvent::SubmissionFinished {
            conversation_id: conversation_id.0,
            outcome: outcome.signal(),
        });
        Ok(outcome)
    }

    /// Stop the running submission at its next step boundary.
    pub fn stop(&self) -> bool {
        self.completion.stop_completion()
    }

    fn validate(&self, text: &str, profile: &ChildProfile) -> Result<(), ValidationError> {
        if self.engine.is_generating() {
            return Err(ValidationError::AlreadyGenerating);
        }
        let missing = profile.missing_fields();
        if !missing.is_empty() {
            return Err(ValidationError::ProfileIncomplete(missing));
        }
        if self.engine.loaded_model().is_none() {
            return Err(ValidationError::NoModelLoaded);
        }
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        Ok(())
    }

    async fn generate(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        history: Vec<Message>,
        user: Message,
        profile: &ChildProfile,
    ) -> SubmissionOutcome {
        let failed = |error: SubmissionFailure, content: String| {
            tracing::warn!(conversation_id = %conversation_id, "Submission failed: {}", error);
            SubmissionOutcome::Failed {
                conversation_id,
                message_id,
                content,
                error,
            }
        };

        let prompt = match self.build_prompt(history, user, profile) {
            Ok(prompt) => prompt,
            Err(e) => return failed(e, String::new()),
        };

        let store = &self.store;
        let events = &self.events;
        let result = self
            .completion
            .create_completion(&prompt, |content| {
                if let Err(e) = store.edit_message_in_conversation(conversation_id, message_id, content) {
                    tracing::error!("Failed to apply streamed content: {}", e);
                    return;
                }
                events.emit(AssistantEvent::MessageUpdated {
                    conversation_id: conversation_id.0,
                    message_id: message_id.0,
                    content: content.to_string(),
                });
            })
            .await;

        match result {
            Ok(completion) => match completion.stop_reason {
                StopReason::Cancelled => SubmissionOutcome::Cancelled {
                    conversation_id,
                    message_id,
                    content: completion.content,
                },
                StopReason::EndOfSequence | StopReason::MaxTokens => SubmissionOutcome::Completed {
                    conversation_id,
                    message_id,
                    content: completion.content,
                },
            },
            Err(e) => failed(e.source.into(), e.partial),
        }
    }

    fn build_prompt(
        &self,
        history: Vec<Message>,
        user: Message,
        profile: &ChildProfile,
    ) -> Result<String, SubmissionFailure> {
        let instance = self.engine.get_instance()?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::ephemeral(Role::System, profile.system_prompt()));
        messages.extend(history);
        messages.push(user);
        Ok(format_chat(instance.as_ref(), &messages)?)
    }

    fn persist(&self) {
        if let Err(e) = self.persistence.save(CONVERSATIONS_KEY, &self.store.snapshot()) {
            tracing::warn!("Failed to persist conversations: {}", e);
        }
    }
}
