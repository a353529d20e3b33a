mod message;
mod store;

pub use message::{Conversation, ConversationId, Message, MessageId, Role};
pub use store::{ConversationSnapshot, ConversationStore};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),
    #[error("message {message} not found in conversation {conversation}")]
    MessageNotFound {
        conversation: ConversationId,
        message: MessageId,
    },
    #[error("message already stored: {0}")]
    DuplicateMessage(MessageId),
    #[error("message id was not allocated by this store: {0}")]
    UnallocatedMessage(MessageId),
}

pub type Result<T> = std::result::Result<T, ConversationError>;
