//! In-memory conversation store.
//!
//! Ids are allocated monotonically; message ids are unique across the whole
//! store. Messages are only ever appended, and edits replace content in place.

use crate::{Conversation, ConversationError, ConversationId, Message, MessageId, Result, Role};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Serializable form of the store, used for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversations: Vec<Conversation>,
}

struct StoreState {
    conversations: Vec<Conversation>,
    next_conversation: u64,
    next_message: u64,
}

impl StoreState {
    fn find_mut(&mut self, id: ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(ConversationError::ConversationNotFound(id))
    }

    fn contains_message(&self, id: MessageId) -> bool {
        self.conversations
            .iter()
            .any(|c| c.messages().iter().any(|m| m.id() == id))
    }

    fn check_insertable(&self, message: &Message) -> Result<()> {
        if message.id().0 == 0 || message.id().0 >= self.next_message {
            return Err(ConversationError::UnallocatedMessage(message.id()));
        }
        if self.contains_message(message.id()) {
            return Err(ConversationError::DuplicateMessage(message.id()));
        }
        Ok(())
    }
}

pub struct ConversationStore {
    state: Mutex<StoreState>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::from_snapshot(ConversationSnapshot::default())
    }

    /// Restore a store; id allocation resumes after the highest restored id.
    pub fn from_snapshot(snapshot: ConversationSnapshot) -> Self {
        let max_conversation = snapshot
            .conversations
            .iter()
            .map(|c| c.id().0)
            .max()
            .unwrap_or(0);
        let max_message = snapshot
            .conversations
            .iter()
            .flat_map(|c| c.messages().iter().map(|m| m.id().0))
            .max()
            .unwrap_or(0);

        Self {
            state: Mutex::new(StoreState {
                conversations: snapshot.conversations,
                next_conversation: max_conversation + 1,
                next_message: max_message + 1,
            }),
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            conversations: self.lock().conversations.clone(),
        }
    }

    /// Allocate a message with a fresh store-wide id. It is not stored yet.
    pub fn new_message(&self, role: Role, content: impl Into<String>) -> Message {
        let mut state = self.lock();
        let id = MessageId(state.next_message);
        state.next_message += 1;
        Message::new(id, role, content.into())
    }

    /// Create a conversation holding only `first`.
    pub fn new_conversation(&self, first: Message) -> Result<Conversation> {
        let mut state = self.lock();
        state.check_insertable(&first)?;

        let id = ConversationId(state.next_conversation);
        state.next_conversation += 1;
        let conversation = Conversation::new(id, first);
        state.conversations.push(conversation.clone());

        tracing::debug!(conversation_id = %id, "Created conversation");
        Ok(conversation)
    }

    /// Append `message` to the end of the conversation.
    pub fn add_message_to_conversation(&self, id: ConversationId, message: Message) -> Result<()> {
        let mut state = self.lock();
        state.check_insertable(&message)?;
        state.find_mut(id)?.messages_mut().push(message);
        Ok(())
    }

    /// Replace the content of one message. Id, role and position are untouched.
    pub fn edit_message_in_conversation(
        &self,
        id: ConversationId,
        message_id: MessageId,
        content: impl Into<String>,
    ) -> Result<()> {
        let mut state = self.lock();
        let message = state
            .find_mut(id)?
            .messages_mut()
            .iter_mut()
            .find(|m| m.id() == message_id)
            .ok_or(ConversationError::MessageNotFound {
                conversation: id,
                message: message_id,
            })?;
        message.set_content(content.into());
        Ok(())
    }

    /// Absence is a normal outcome, not an error.
    pub fn get_conversation_by_id(&self, id: ConversationId) -> Option<Conversation> {
        self.lock().conversations.iter().find(|c| c.id() == id).cloned()
    }

    /// All conversations in creation order.
    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.lock().conversations.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().conversations.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("conversation store mutex poisoned")
    }
}
