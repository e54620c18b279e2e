//! Wire records shared between client and server.
//!
//! These are the payload types carried inside protocol events: message
//! records, conversation summaries, and presence snapshots. The engine
//! uses the same types as its in-memory domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type! {
    /// Identifier of a user account.
    UserId
}

id_type! {
    /// Identifier of a two-party conversation.
    ConversationId
}

id_type! {
    /// Identifier of a chat message.
    MessageId
}

/// Role classification of an online user.
///
/// Derived from the account role plus seller-approval flags by the
/// credential verifier; the engine never recomputes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleClass {
    /// May offer services; listed on the anonymous provider feed.
    ProviderCapable,
    /// May only request services.
    RequesterOnly,
}

impl RoleClass {
    /// Whether this role is listed on the anonymous provider feed.
    #[must_use]
    pub fn is_provider(self) -> bool {
        matches!(self, RoleClass::ProviderCapable)
    }
}

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    /// References a marketplace offer by `reference_id`.
    Offer,
}

/// Kind of a broadcast topic used by external marketplace services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Order,
    Dispute,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::Order => write!(f, "order"),
            TopicKind::Dispute => write!(f, "dispute"),
        }
    }
}

/// A persisted chat message.
///
/// Content fields are immutable after creation; `delivered_at` and
/// `seen_at` are each set at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    /// Reference to an external marketplace object (offer, order).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set iff the recipient had an active connection when the message
    /// was created, or retroactively when they next reconnect.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set when the recipient's conversation room was open at send time,
    /// or in bulk by read catch-up on a later join.
    pub seen_at: Option<DateTime<Utc>>,
}

/// Client-supplied content of a message about to be sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default = "MessageDraft::default_kind")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl MessageDraft {
    fn default_kind() -> MessageKind {
        MessageKind::Text
    }

    /// A plain text draft.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A draft carries substance if it has text, an attachment, or a
    /// reference to an external object.
    #[must_use]
    pub fn has_substance(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
            || self.attachment_url.is_some()
            || self.reference_id.is_some()
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Text
    }
}

/// A conversation with its denormalized summary projection.
///
/// The summary fields exist purely for fast list ordering; unread state
/// is never derived from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_id: Option<UserId>,
}

impl Conversation {
    /// The participant other than `user`, for two-party conversations.
    #[must_use]
    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        self.participants.iter().copied().find(|p| *p != user)
    }

    /// Whether `user` is a stored participant.
    #[must_use]
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }
}

/// Per-participant read state for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    /// Authoritative unread counter, never derived client-side.
    pub unread_count: u32,
    /// Read watermark: messages at or before this instant are seen.
    pub last_read_at: DateTime<Utc>,
}

/// A conversation as presented to one participant, carrying that
/// participant's own unread count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOverview {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: u32,
}

/// Presence snapshot entry pushed to authenticated sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub role: RoleClass,
    pub last_active: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_substance() {
        assert!(MessageDraft::text("hi").has_substance());
        assert!(!MessageDraft::text("   ").has_substance());
        assert!(!MessageDraft::default().has_substance());

        let attachment = MessageDraft {
            attachment_url: Some("https://cdn/x.png".into()),
            kind: MessageKind::Image,
            ..MessageDraft::default()
        };
        assert!(attachment.has_substance());

        let offer = MessageDraft {
            reference_id: Some("offer-42".into()),
            kind: MessageKind::Offer,
            ..MessageDraft::default()
        };
        assert!(offer.has_substance());
    }

    #[test]
    fn test_other_participant() {
        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = Conversation {
            id: ConversationId::generate(),
            participants: vec![a, b],
            created_at: Utc::now(),
            last_message_text: None,
            last_message_at: None,
            last_sender_id: None,
        };

        assert_eq!(conversation.other_participant(a), Some(b));
        assert_eq!(conversation.other_participant(b), Some(a));
        assert!(conversation.has_participant(a));
        assert!(!conversation.has_participant(UserId::generate()));
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let message = ChatMessage {
            id: MessageId::generate(),
            conversation_id: ConversationId::generate(),
            sender_id: UserId::generate(),
            kind: MessageKind::Text,
            content: Some("hello".into()),
            attachment_url: None,
            attachment_name: None,
            reference_id: None,
            created_at: Utc::now(),
            delivered_at: Some(Utc::now()),
            seen_at: None,
        };

        let json = serde_json::to_string(&message).unwrap();
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
