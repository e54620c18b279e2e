//! Error taxonomy for the Courier engine.
//!
//! Per-action errors are recovered locally and reported back to the
//! acting connection as a generic `error` event; they never terminate
//! the connection and never leave partial writes behind.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Bad, missing, or expired credential; the connection is refused
    /// and no session is ever created.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Room join, send, or typing by a non-member of the conversation.
    #[error("Not a participant of this conversation")]
    NotParticipant,

    /// Unknown conversation id.
    #[error("Conversation not found")]
    ConversationNotFound,

    /// A send with no text, no attachment, and no object reference.
    #[error("Invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// A storage collaborator failed.
    #[error("Store error: {0}")]
    Store(String),
}

impl ChatError {
    /// Shorthand for a store failure.
    pub fn store(err: impl ToString) -> Self {
        ChatError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ChatError::NotParticipant.to_string(),
            "Not a participant of this conversation"
        );
        assert_eq!(
            ChatError::InvalidPayload("empty message").to_string(),
            "Invalid payload: empty message"
        );
    }
}
