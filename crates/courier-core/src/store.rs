//! Collaborator interfaces: persistence, credential verification, and
//! notification dispatch.
//!
//! The engine never talks to a database or an auth service directly;
//! it goes through these traits. Message and participant records are
//! mutated only by the dispatcher and the conversation room manager.

use crate::error::ChatError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{
    ChatMessage, Conversation, ConversationId, ConversationOverview, MessageId, MessageKind,
    ParticipantState, RoleClass, UserId,
};

/// An authenticated identity resolved from a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: RoleClass,
}

/// Black-box credential verifier.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a bearer credential to a user identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::AuthenticationFailed`] for missing,
    /// malformed, or expired credentials.
    async fn verify(&self, token: &str) -> Result<Identity, ChatError>;
}

/// Out-of-band notification collaborator (push/email). Failures must
/// never fail the action that triggered them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_unread(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message: &ChatMessage,
        unread_count: u32,
    ) -> Result<(), ChatError>;
}

/// Fields of a message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub reference_id: Option<String>,
    /// Set iff the recipient has an active connection at creation.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set iff the recipient's conversation room is open at creation.
    pub seen_at: Option<DateTime<Utc>>,
}

/// Persistence collaborator for conversations, participants, and
/// messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Fetch a conversation by id.
    async fn conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, ChatError>;

    /// All conversations for a user, newest activity first, each with
    /// that user's own unread count.
    async fn conversations_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationOverview>, ChatError>;

    /// Find an existing two-party conversation between two users.
    async fn conversation_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, ChatError>;

    /// Create a conversation between two users with zeroed participant
    /// states.
    async fn create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Conversation, ChatError>;

    /// Read state for one participant; `None` if not a participant.
    async fn participant_state(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ParticipantState>, ChatError>;

    /// Persist a new message.
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, ChatError>;

    /// One page of messages, oldest first within the page.
    async fn messages_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError>;

    /// Creation time of the newest message, if any.
    async fn latest_message_at(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>, ChatError>;

    /// Overwrite the denormalized conversation summary.
    async fn update_summary(
        &self,
        conversation_id: ConversationId,
        last_message_text: Option<String>,
        last_message_at: DateTime<Utc>,
        last_sender_id: UserId,
    ) -> Result<(), ChatError>;

    /// Reset a participant's unread count to 0 and advance their read
    /// watermark.
    async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<(), ChatError>;

    /// Increment a participant's unread count by one; returns the new
    /// count.
    async fn increment_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u32, ChatError>;

    /// Mark every undelivered message in a conversation not authored by
    /// `reader` as delivered at `at`. Returns how many were marked.
    async fn mark_delivered(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, ChatError>;

    /// Mark every unseen message not authored by `reader` with
    /// `created_at <= watermark` as seen at `at`. Returns the ids
    /// marked.
    async fn mark_seen_up_to(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        watermark: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, ChatError>;

    /// Retroactively mark undelivered messages addressed to a newly
    /// connected recipient, across all their conversations. Returns how
    /// many were marked.
    async fn mark_delivered_for_recipient(
        &self,
        recipient: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, ChatError>;
}
